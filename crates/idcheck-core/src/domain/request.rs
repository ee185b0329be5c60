//! Registration request: the payload a client publishes under `check`.

use serde::{Deserialize, Serialize};

/// Length of a national identity number.
pub const DNI_LEN: usize = 8;

/// Is `candidate` an 8-digit numeric identity number?
pub fn is_well_formed_dni(candidate: &str) -> bool {
    candidate.len() == DNI_LEN && candidate.bytes().all(|b| b.is_ascii_digit())
}

/// A person asking to be registered, plus the contacts they declare.
///
/// Not persisted by the validation stage. Field names follow the wire schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub dni: String,

    #[serde(rename = "nombre")]
    pub name: String,

    #[serde(rename = "correo")]
    pub email: String,

    #[serde(rename = "clave")]
    pub password: String,

    #[serde(rename = "telefono")]
    pub phone: String,

    /// Identity numbers of declared contacts, in the order given.
    #[serde(rename = "amigos", default, skip_serializing_if = "Option::is_none")]
    pub contacts: Option<Vec<String>>,
}

impl RegistrationRequest {
    pub fn new(
        dni: impl Into<String>,
        name: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
        phone: impl Into<String>,
    ) -> Self {
        Self {
            dni: dni.into(),
            name: name.into(),
            email: email.into(),
            password: password.into(),
            phone: phone.into(),
            contacts: None,
        }
    }

    pub fn with_contacts<I, S>(mut self, contacts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.contacts = Some(contacts.into_iter().map(Into::into).collect());
        self
    }

    /// Declared contacts, empty when none were given.
    pub fn contact_ids(&self) -> &[String] {
        self.contacts.as_deref().unwrap_or_default()
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
