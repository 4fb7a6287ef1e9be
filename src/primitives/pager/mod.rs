#![forbid(unsafe_code)]

mod frame;
mod pager;

pub use frame::{
    down_s, downgrade, upgrade, ExclusiveLatch, Frame, SharedLatch, UpdateLatch,
};
pub use pager::{BufferManager, Pager, PagerStats};
