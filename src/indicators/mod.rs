// Technical indicators module
// Pure functions over candle slices used by the Jigsaw checklist and the backtester

pub mod adx;
pub mod atr;
pub mod bands;
pub mod heikin_ashi;
pub mod moving_average;
pub mod stochastic;
pub mod volume;
pub mod vwap;

pub use adx::calculate_adx;
pub use atr::{calculate_atr, calculate_atr_series, true_range_series};
pub use bands::{
    bollinger_bands, bollinger_width, donchian_channel, is_squeeze_on, keltner_channel, Channel,
};
pub use heikin_ashi::{classify_bar, ha_signal, has_ha_signal, heikin_ashi, HaCandle};
pub use moving_average::{calculate_ema, calculate_sma, ema_series, mean, sample_std, sma_series};
pub use stochastic::{calculate_stochastic, stochastic_series, Stochastic};
pub use volume::{is_volume_spike, volume_ratio};
pub use vwap::{calculate_vwap, vwap_or_sma, vwap_series};
