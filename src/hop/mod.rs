pub mod plan;
pub mod sweep;
pub mod tracker;

pub use self::plan::{ChannelPlan, Region};
pub use self::sweep::Sweep;
pub use self::tracker::{HopEvent, HopTracker, PacketOutcome, Step, TrackerConfig};
