//! Entities served by the shopping-list API.
//!
//! Field names follow the server's JSON. Timestamps are naive UTC, which is
//! what the server emits (`2024-06-15T12:00:00.123456`).

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Server-assigned entity identity.
pub type EntityId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default = "default_color")]
    pub color: String,
}

fn default_color() -> String {
    "#6b7280".to_string()
}

fn default_unit() -> String {
    "x".to_string()
}

/// A shared catalogue item. List and session entries reference it by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub category_id: Option<EntityId>,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub created_at: Option<NaiveDateTime>,
}

/// One entry on the household shopping list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListItem {
    pub id: EntityId,
    pub item_id: EntityId,
    pub quantity: f64,
    #[serde(default = "default_unit")]
    pub unit: String,
    #[serde(default)]
    pub checked: bool,
    #[serde(default)]
    pub added_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub from_recipe_id: Option<EntityId>,
    pub item: Item,
}

/// One line of an active shopping run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionItem {
    pub id: EntityId,
    #[serde(default)]
    pub item_id: Option<EntityId>,
    pub item_name: String,
    #[serde(default = "default_quantity")]
    pub quantity: f64,
    #[serde(default = "default_unit")]
    pub unit: String,
    /// Optimistic until a toggle round trip confirms it
    #[serde(default)]
    pub checked: bool,
    /// Local clock while optimistic, the server's value once confirmed
    #[serde(default)]
    pub checked_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub item: Option<Item>,
}

fn default_quantity() -> f64 {
    1.0
}

impl SessionItem {
    /// Current check state of this line.
    pub fn check_state(&self) -> CheckState {
        CheckState {
            checked: self.checked,
            checked_at: self.checked_at,
        }
    }
}

/// The household's running shopping session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub id: EntityId,
    pub started_at: NaiveDateTime,
    #[serde(default)]
    pub completed_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub session_items: Vec<SessionItem>,
}

/// Canonical check fields returned by the toggle endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckState {
    pub checked: bool,
    pub checked_at: Option<NaiveDateTime>,
}

/// Request body entry for adding items to the list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewListEntry {
    pub item_id: EntityId,
    pub quantity: f64,
    pub unit: String,
}

impl NewListEntry {
    pub fn new(item_id: EntityId, quantity: f64, unit: impl Into<String>) -> Self {
        Self {
            item_id,
            quantity,
            unit: unit.into(),
        }
    }
}
