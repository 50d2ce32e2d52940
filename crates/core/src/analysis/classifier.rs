use crate::domain::report::{
    AverageReading, ClassifiedAverage, ClassifiedIndicators, ClassifiedMacd, ClassifiedRsi,
    MacdReading, RawIndicators, RsiSignal, TrendSignal,
};

pub const RSI_OVERBOUGHT: f64 = 70.0;
pub const RSI_OVERSOLD: f64 = 30.0;

pub fn classify(raw: &RawIndicators) -> ClassifiedIndicators {
    ClassifiedIndicators {
        sma: classify_average(raw.sma),
        ema: classify_average(raw.ema),
        rsi: ClassifiedRsi {
            value: raw.rsi,
            signal: rsi_signal(raw.rsi),
        },
        macd: classify_macd(raw.macd),
    }
}

/// Price above the average is bullish, below is bearish.
pub fn average_signal(price: f64, indicator: f64) -> TrendSignal {
    if price > indicator {
        TrendSignal::Bullish
    } else if price < indicator {
        TrendSignal::Bearish
    } else {
        TrendSignal::Neutral
    }
}

pub fn rsi_signal(rsi: f64) -> RsiSignal {
    if rsi > RSI_OVERBOUGHT {
        RsiSignal::Overbought
    } else if rsi < RSI_OVERSOLD {
        RsiSignal::Oversold
    } else {
        RsiSignal::Neutral
    }
}

pub fn macd_signal(macd: f64, signal_line: f64) -> TrendSignal {
    if macd > signal_line {
        TrendSignal::Bullish
    } else if macd < signal_line {
        TrendSignal::Bearish
    } else {
        TrendSignal::Neutral
    }
}

fn classify_average(reading: AverageReading) -> ClassifiedAverage {
    ClassifiedAverage {
        value: reading.value,
        price: reading.price,
        signal: average_signal(reading.price, reading.value),
    }
}

fn classify_macd(reading: MacdReading) -> ClassifiedMacd {
    ClassifiedMacd {
        macd: reading.macd,
        signal_line: reading.signal,
        signal: macd_signal(reading.macd, reading.signal),
    }
}
