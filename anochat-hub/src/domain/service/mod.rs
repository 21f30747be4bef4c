pub mod complaint;
pub mod hub;
pub mod matcher;

pub use complaint::{ComplaintPipeline, ComplaintService};
pub use hub::{ChatHub, HubHandle, SessionRestorer};
pub use matcher::MatcherService;

#[cfg(test)]
mod mocks_test;

#[cfg(test)]
mod matcher_test;
