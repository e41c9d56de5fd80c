// =============================================================================
// Chart indicators
// =============================================================================
//
// Pure, side-effect-free helpers recomputed from scratch over the candle
// series on every mutation. Per-chart series are bounded (hundreds of bars,
// not millions), so the full pass stays cheap. Every public function returns
// `Option`/empty `Vec` so callers must handle insufficient data.

pub mod ema;
pub mod sma;
