mod app_client_map;
mod error;
mod rtm;

pub use error::{AdmissionRule, RtmError};
pub use rtm::{RequestedTaskManager, SubtaskDefinition};

#[cfg(test)]
mod tests;
