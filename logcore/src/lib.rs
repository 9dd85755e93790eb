pub mod error;
pub mod nvtable;
pub mod logstamp;
pub mod tags;
pub mod macros;
pub mod logmsg;
pub mod radix;
pub mod matcher;
pub mod template;
pub mod patterndb;
pub mod transport;
pub mod proto;
pub mod source;

pub use error::{Error, Result};
