//! Endpoint - 接続先の記述
//!
//! ブローカー・レジストリのアダプタはこれを受け取って接続する。
//! ログやエラーには `redacted()` を使い、パスワードを出さない。

use std::fmt;

/// Where the message broker lives and how to log in.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl BrokerEndpoint {
    /// Full AMQP URL, credentials included.
    pub fn url(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}",
            self.user, self.password, self.host, self.port
        )
    }

    pub fn redacted(&self) -> String {
        format!("amqp://{}:***@{}:{}", self.user, self.host, self.port)
    }
}

impl Default for BrokerEndpoint {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5672,
            user: "guest".into(),
            password: "guest".into(),
        }
    }
}

// never print the password, not even in `{:?}`
impl fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Where the identity registry database lives.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl RegistryEndpoint {
    pub fn url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }

    pub fn redacted(&self) -> String {
        format!(
            "mysql://{}:***@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }
}

impl Default for RegistryEndpoint {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 3306,
            user: "root".into(),
            password: String::new(),
            database: "bd2".into(),
        }
    }
}

impl fmt::Debug for RegistryEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}
