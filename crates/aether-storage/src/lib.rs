// SQLite storage layer with sqlx
//
// SqliteKv implements the kernel's KvStore trait over a single-file database
// under the data dir; the user, token, and app stores are typed repositories
// layered on top of it.

pub mod apps;
pub mod kv;
pub mod password;
pub mod users;

pub use apps::{App, AppStore};
pub use kv::SqliteKv;
pub use password::{hash_password, verify_password};
pub use users::{hash_token, Role, TokenStore, User, UserStore};
