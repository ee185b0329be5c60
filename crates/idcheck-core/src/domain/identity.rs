//! Identity records held by the registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered person, keyed by an 8-digit identity number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub dni: String,
    pub given_name: String,
    pub surnames: String,
    pub birthplace: String,
    /// Geographic (ubigeo) code.
    pub geo_code: String,
    pub address: String,
    pub created_at: DateTime<Utc>,
}

impl IdentityRecord {
    pub fn new(
        dni: impl Into<String>,
        given_name: impl Into<String>,
        surnames: impl Into<String>,
        birthplace: impl Into<String>,
        geo_code: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            dni: dni.into(),
            given_name: given_name.into(),
            surnames: surnames.into(),
            birthplace: birthplace.into(),
            geo_code: geo_code.into(),
            address: address.into(),
            created_at: Utc::now(),
        }
    }

    /// Name shown to callers: given name followed by surnames.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.given_name, self.surnames)
    }
}

/// Fixed reference set seeded into the registry at worker start.
pub fn reference_identities() -> Vec<IdentityRecord> {
    [
        ("20453629", "Juan", "Pérez García", "Lima", "150101", "Av. Principal 123"),
        ("12345678", "María", "López Díaz", "Cusco", "080101", "Jr. Secundario 456"),
        ("87654321", "Carlos", "Rodríguez Soto", "Arequipa", "040101", "Calle Tercera 789"),
        ("11111111", "Ana", "Martínez Ruiz", "Trujillo", "130101", "Av. Libertad 111"),
        ("22222222", "Luis", "García López", "Piura", "200101", "Calle Mayor 222"),
    ]
    .into_iter()
    .map(|(dni, name, surnames, place, geo, address)| {
        IdentityRecord::new(dni, name, surnames, place, geo, address)
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::request::is_well_formed_dni;

    #[test]
    fn reference_set_is_well_formed_and_unique() {
        let records = reference_identities();
        assert_eq!(records.len(), 5);
        assert!(records.iter().all(|r| is_well_formed_dni(&r.dni)));
        let mut dnis: Vec<_> = records.iter().map(|r| r.dni.as_str()).collect();
        dnis.sort();
        dnis.dedup();
        assert_eq!(dnis.len(), 5);
    }

    #[test]
    fn display_name_joins_given_name_and_surnames() {
        let maria = reference_identities()
            .into_iter()
            .find(|r| r.dni == "12345678")
            .unwrap();
        assert_eq!(maria.display_name(), "María López Díaz");
    }
}
