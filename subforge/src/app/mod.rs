pub mod compiler;

pub use compiler::{Compiler, GeneratedOutbounds};

/// Progress sink: percentage (`-1` on failure) and a short message for display.
pub type Progress<'a> = &'a mut (dyn FnMut(f64, &str) + Send);
