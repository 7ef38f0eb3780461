pub mod config;
pub mod demux;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod guest;
pub mod hyperstart;
pub mod registry;
pub mod relocate;
pub mod session;
pub mod token;
pub mod vm;

pub use config::EngineConfig;
pub use dispatch::{CommandHandler, DispatchError, Dispatcher, HandlerResponse, StreamHandler};
pub use error::{ErrorKind, Result, VmError};
pub use guest::{GuestTransport, IoMessage};
pub use hyperstart::HyperstartTransport;
pub use registry::SessionRegistry;
pub use session::{
    ClientHandle, FIRST_IO_BASE, IoSession, NULL_SESSION_STDERR, NULL_SESSION_STDOUT,
    STREAMS_PER_SESSION,
};
pub use token::{TOKEN_BYTES, Token};
pub use vm::Vm;
