//! Vesper client runtime.
//!
//! Binds the sans-IO protocol core to real collaborators: the relay
//! transport, the bundle directory, and the session store.
//!
//! ## Architecture
//!
//! ```text
//! vesper-client
//!   ├─ Messenger       (send/receive control flow, per-pair locking)
//!   ├─ RelayTransport  (store-and-forward interface + retry/backoff)
//!   ├─ InMemoryRelay   (test/simulation relay, fault injection)
//!   └─ SystemEnv       (production Environment impl)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod messenger;
mod relay;
mod system_env;

pub use messenger::{Inbound, Messenger, SendReceipt};
pub use relay::{InMemoryRelay, MessageId, RelayDelivery, RelayTransport, RetryPolicy};
pub use system_env::SystemEnv;
