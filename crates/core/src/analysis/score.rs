use crate::domain::report::{ClassifiedIndicators, RsiSignal, ScoreVector, TrendSignal};

const SCORE_MIN: f64 = 0.0;
const SCORE_MAX: f64 = 100.0;
const SCORE_MID: f64 = 50.0;

pub fn normalize(classified: &ClassifiedIndicators) -> ScoreVector {
    ScoreVector {
        trend_strength: clamp_score(trend_strength(classified.sma.signal, classified.ema.signal)),
        momentum_strength: clamp_score(momentum_strength(
            classified.rsi.signal,
            classified.rsi.value,
        )),
        macd_strength: clamp_score(macd_strength(classified.macd.signal)),
        price_strength: clamp_score(price_strength(classified.sma.price, classified.sma.value)),
        volatility: clamp_score(stability(classified.macd.macd)),
    }
}

/// Two agreeing bullish averages outweigh a single bullish reading.
pub fn trend_strength(sma: TrendSignal, ema: TrendSignal) -> f64 {
    match (sma, ema) {
        (TrendSignal::Bullish, TrendSignal::Bullish) => 100.0,
        (TrendSignal::Bearish, TrendSignal::Bearish) => 0.0,
        (TrendSignal::Bullish, _) | (_, TrendSignal::Bullish) => 75.0,
        _ => 25.0,
    }
}

/// The neutral band passes RSI through on its own scale.
pub fn momentum_strength(signal: RsiSignal, rsi: f64) -> f64 {
    match signal {
        RsiSignal::Oversold => 0.0,
        RsiSignal::Overbought => 100.0,
        RsiSignal::Neutral => rsi,
    }
}

pub fn macd_strength(signal: TrendSignal) -> f64 {
    match signal {
        TrendSignal::Bullish => 100.0,
        TrendSignal::Bearish => 0.0,
        TrendSignal::Neutral => 50.0,
    }
}

pub fn price_strength(price: f64, sma: f64) -> f64 {
    ((price - sma) / sma) * 100.0 + SCORE_MID
}

pub fn stability(macd: f64) -> f64 {
    SCORE_MAX - macd.abs() * 10.0
}

/// Clamps into 0..=100; NaN (e.g. a zero SMA) collapses to the midpoint.
pub fn clamp_score(value: f64) -> f64 {
    if value.is_nan() {
        return SCORE_MID;
    }
    value.clamp(SCORE_MIN, SCORE_MAX)
}
