//! Byte-stream plumbing for the composed response.

mod late;
mod meter;

pub use late::{AsyncSection, Attachment, SectionDrain, SectionPlugged};
pub use meter::MeteredStream;
