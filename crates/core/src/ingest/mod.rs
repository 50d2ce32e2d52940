pub mod alpha_vantage;
pub mod news;
pub mod provider;
pub mod types;

pub use provider::{IndicatorProvider, NewsProvider};
