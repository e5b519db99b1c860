pub mod broker;
pub mod cli;
pub mod consumer;
pub mod context;
pub mod payload;
pub mod protocol;

pub use broker::{Broker, BrokerPort, QueueBroker};
pub use consumer::{Client, ClientError, ClientStats, Consumer, ConsumerConfig, ConsumerError};
pub use context::IoContextPool;
pub use payload::{ParaboloidItem, ProcessError, Processable};
pub use protocol::{Command, CommandEnvelope, SerializationMode};
