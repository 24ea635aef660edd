pub mod forecast;
pub mod record;
pub mod snapshot;

pub use forecast::*;
pub use record::*;
pub use snapshot::*;

/// Everything sampled in one cycle. A `None` means the source failed or timed out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotBundle {
    pub inverter: Option<RawSnapshot>,
    pub weather: Option<RawSnapshot>,
    pub forecast: Option<Forecast>,
    pub devices: Option<RawSnapshot>,
}
