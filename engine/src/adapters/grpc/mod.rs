mod mappers;
mod service;

pub use service::NodeAgentService;
