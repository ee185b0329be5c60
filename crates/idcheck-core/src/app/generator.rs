//! RequestGenerator - 負荷試験用のランダムな登録リクエスト
//!
//! - 名前・ドメインは固定リストから選ぶ
//! - DNI は 8 桁、電話は 9 から始まる 9 桁
//! - 半分の確率で 1〜3 件の重複しない連絡先を付ける（本人の DNI は除く）

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::domain::RegistrationRequest;

const GIVEN_NAMES: &[&str] = &[
    "Lucia", "Mateo", "Sofia", "Santiago", "Valentina", "Sebastian", "Isabella", "Matias",
    "Camila", "Nicolas",
];
const SURNAMES: &[&str] = &[
    "Gomez", "Rodriguez", "Diaz", "Perez", "Vargas", "Castro", "Sanchez", "Rojas", "Ortiz",
    "Silva",
];
const DOMAINS: &[&str] = &["example.com", "test.net", "demo.org", "mailservice.io"];

/// Contact candidates; the last two are deliberately absent from the
/// reference registry.
pub const CONTACT_POOL: &[&str] = &[
    "20453629", "12345678", "87654321", "11111111", "22222222", "33333333", "44444444",
];

pub struct RequestGenerator {
    rng: StdRng,
}

impl RequestGenerator {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic sequence, for tests and reproducible runs.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn next_request(&mut self) -> RegistrationRequest {
        let given = pick(&mut self.rng, GIVEN_NAMES);
        let surname = pick(&mut self.rng, SURNAMES);
        let email = format!(
            "{}.{}{}@{}",
            given.to_lowercase(),
            surname.to_lowercase(),
            self.rng.gen_range(0..1000),
            pick(&mut self.rng, DOMAINS)
        );
        let dni = self.rng.gen_range(10_000_000u32..100_000_000).to_string();
        let phone = format!("9{}", self.rng.gen_range(10_000_000u32..100_000_000));
        let password = format!("pass{}", self.rng.gen_range(1000..10_000));

        let mut request =
            RegistrationRequest::new(dni, format!("{given} {surname}"), email, password, phone);

        if self.rng.gen_bool(0.5) {
            let wanted = self.rng.gen_range(1..=3);
            let candidates: Vec<&str> = CONTACT_POOL
                .iter()
                .copied()
                .filter(|c| *c != request.dni)
                .collect();
            let contacts: Vec<&str> = candidates
                .choose_multiple(&mut self.rng, wanted)
                .copied()
                .collect();
            if !contacts.is_empty() {
                request = request.with_contacts(contacts);
            }
        }
        request
    }
}

impl Default for RequestGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn pick<'a>(rng: &mut StdRng, items: &[&'a str]) -> &'a str {
    items.choose(rng).copied().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::is_well_formed_dni;
    use std::collections::HashSet;

    #[test]
    fn generated_requests_are_well_formed() {
        let mut generator = RequestGenerator::seeded(7);
        for _ in 0..500 {
            let req = generator.next_request();
            assert!(is_well_formed_dni(&req.dni), "bad dni {}", req.dni);
            assert_eq!(req.phone.len(), 9);
            assert!(req.phone.starts_with('9'));
            assert!(req.email.contains('@'));
            assert!(req.password.starts_with("pass"));

            let contacts = req.contact_ids();
            assert!(contacts.len() <= 3);
            let unique: HashSet<_> = contacts.iter().collect();
            assert_eq!(unique.len(), contacts.len());
            assert!(!contacts.contains(&req.dni));
            assert!(contacts.iter().all(|c| CONTACT_POOL.contains(&c.as_str())));
        }
    }

    #[test]
    fn roughly_half_declare_contacts() {
        let mut generator = RequestGenerator::seeded(42);
        let with_contacts = (0..1000)
            .filter(|_| generator.next_request().contacts.is_some())
            .count();
        assert!((350..650).contains(&with_contacts), "{with_contacts}");
    }

    #[test]
    fn same_seed_same_sequence() {
        let mut a = RequestGenerator::seeded(3);
        let mut b = RequestGenerator::seeded(3);
        for _ in 0..10 {
            assert_eq!(a.next_request(), b.next_request());
        }
    }
}
