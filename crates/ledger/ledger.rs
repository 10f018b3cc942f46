pub mod account;
pub mod error;
pub mod manager;
pub mod task_queue;
pub mod transaction;

pub use account::{Account, InputRef, Utxo};
pub use error::{LedgerError, QueueError};
pub use manager::{EscrowCtrl, TransactionManager};
pub use task_queue::{ProcessingTaskQueue, SubTask, Task, TaskLock, TaskResult};
pub use transaction::{OutputDest, Transaction, TxKind};
