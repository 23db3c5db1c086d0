mod activation;
mod back_link;
mod dropout;
mod eltwise;
mod fully_connected;
mod lstm;
mod merge;
mod recurrent;
mod sink;
mod source;
mod split;

pub use activation::Activation;
pub use back_link::BackLink;
pub use dropout::Dropout;
pub use eltwise::{EltwiseDiv, EltwiseMax, EltwiseMul, EltwiseNegMul, EltwiseSub, EltwiseSum};
pub use fully_connected::FullyConnected;
pub use lstm::{Lstm, LstmGate};
pub use merge::Merge;
pub use recurrent::{InputMapping, OutputMapping, Recurrent};
pub use sink::Sink;
pub use source::Source;
pub use split::Split;
