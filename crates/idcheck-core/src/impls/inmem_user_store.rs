//! InMemoryUserStore - 永続化ステージの開発用 SaveHandler
//!
//! 本番の永続化ステージはこのクレートの外にある。ここではデモとテストのために
//! 契約（重複 DNI の拒否、既存ユーザーのみ友人としてリンク）だけを満たす。

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::domain::RegistrationRequest;
use crate::ports::{SaveHandler, SaveReceipt};

#[derive(Default)]
struct Users {
    by_dni: HashMap<String, u64>,
    links: Vec<(u64, u64)>,
    next_id: u64,
}

#[derive(Default)]
pub struct InMemoryUserStore {
    users: Mutex<Users>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn user_count(&self) -> usize {
        self.users.lock().await.by_dni.len()
    }

    pub async fn link_count(&self) -> usize {
        self.users.lock().await.links.len()
    }
}

#[async_trait]
impl SaveHandler for InMemoryUserStore {
    async fn save(&self, request: &RegistrationRequest) -> Result<SaveReceipt, String> {
        let mut users = self.users.lock().await;
        if users.by_dni.contains_key(&request.dni) {
            return Err(format!("Usuario con DNI {} ya existe", request.dni));
        }

        users.next_id += 1;
        let user_id = users.next_id;
        users.by_dni.insert(request.dni.clone(), user_id);

        let mut linked_contacts = Vec::new();
        for contact in request.contact_ids() {
            let Some(&contact_id) = users.by_dni.get(contact) else {
                continue;
            };
            if !users.links.contains(&(user_id, contact_id)) {
                users.links.push((user_id, contact_id));
            }
            linked_contacts.push(contact.clone());
        }

        Ok(SaveReceipt {
            user_id,
            linked_contacts,
        })
    }
}
