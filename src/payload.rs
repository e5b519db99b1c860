//! Work items that can be shipped to a worker and processed there.
//!
//! The transport layer never looks inside a payload. It only needs to be able to
//! serialize it, move it between threads and ask it to [`process`](Processable::process)
//! itself once it has arrived at a worker. Results are stored inside the item, which is
//! then sent back to the consumer as a whole.
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Failure raised by a payload while processing.
#[derive(Debug, Error)]
#[error("processing failed: {0}")]
pub struct ProcessError(pub String);

/// A unit of work executed on a worker.
pub trait Processable: Serialize + DeserializeOwned + Send + 'static {
    /// Runs the work and stores the result inside `self`.
    fn process(&mut self) -> Result<(), ProcessError>;
}

/// Demo payload that evaluates a multi-dimensional paraboloid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParaboloidItem {
    pub id: u64,
    pub parameters: Vec<f64>,
    pub result: Option<f64>,
}

impl ParaboloidItem {
    pub fn new(id: u64, parameters: Vec<f64>) -> Self {
        Self {
            id,
            parameters,
            result: None,
        }
    }
}

impl Processable for ParaboloidItem {
    fn process(&mut self) -> Result<(), ProcessError> {
        if self.parameters.iter().any(|p| !p.is_finite()) {
            return Err(ProcessError(format!(
                "item {} carries non-finite parameters",
                self.id
            )));
        }
        let result: f64 = self.parameters.iter().map(|p| p * p).sum();
        if !result.is_finite() {
            return Err(ProcessError(format!(
                "item {} overflowed to {result}",
                self.id
            )));
        }
        self.result = Some(result);
        Ok(())
    }
}
