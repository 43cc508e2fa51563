//! Credit based streaming primitives shared by the micro gateways.
//!
//! Every gateway in this workspace speaks two sides: a physical network
//! byte stream and the internal *fabric* message bus toward the application.
//! Both sides are flow controlled with the same `sequence` / `acknowledge` /
//! `maximum` triple and both borrow partial frame storage from a shared
//! [`BufferPool`].
//!
//! # Components
//!
//! - [`buffer`]: fixed capacity slot pool, slots are released when the owning [`Slot`] drops
//! - [`window`]: the credit triple used for every stream direction
//! - [`budget`]: shared connection budgets split between streams (creditor / debitor)
//! - [`frame`]: the fabric message set (`Begin`, `Data`, `End`, ...)
//! - [`binding`]: collaborator interfaces (routes, guards, access control, validators)
//! - [`signal`]: deadline based signals re-entering a stream later
//! - [`context`]: the pool, budgets, signals and id supply handed to every connection
//!
//! All state machines built on top of these primitives are sans-IO: a call
//! consumes what it can, pushes frames into an [`Outbox`] and returns.
//!
//! # Example
//!
//! ```
//! use micro_fabric::{BufferPool, Window};
//!
//! let pool = BufferPool::new(16, 2);
//! let mut slot = pool.acquire(1).expect("slot available");
//! slot.try_put(b"GET / HT").unwrap();
//! assert_eq!(slot.as_slice(), b"GET / HT");
//!
//! let mut window = Window::default();
//! window.grant(0, 8);
//! assert_eq!(window.available(), 8);
//! ```

pub mod binding;
pub mod budget;
pub mod buffer;
pub mod config;
pub mod context;
mod error;
pub mod frame;
pub mod signal;
mod utils;
pub mod window;

pub use binding::{AccessControl, Collaborators, Guard, HeaderLookup, Route, RouteResolver, Validator};
pub use budget::{BudgetCreditor, BudgetDebitor, CreditorIndex};
pub use buffer::{BufferPool, Slot};
pub use config::BufferPoolConfig;
pub use context::{Context, StreamIds};
pub use error::FabricError;
pub use frame::{
    AbortFrame, BeginFrame, ChallengeFrame, DataFrame, EndFrame, FlushFrame, Frame, NetworkExtension, Outbox, ResetFrame,
    SignalFrame, StreamHeader, TransportInfo, WindowFrame, flags,
};
pub use signal::{FiredSignal, SignalId, Signals};
pub use window::Window;

pub(crate) use utils::ensure;
