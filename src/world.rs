//! In-memory reference implementation of [`HostWorld`].
//!
//! The real game owns its own world; this one backs the `mod_check` binary
//! and the test suite with the same rule enforcement the bridge promises:
//! defense-reduced damage, HP clamped to `[0, max_hp]`, and the per-entity
//! scratch map cleared when its owner dies or despawns.

use std::collections::{BTreeMap, BTreeSet};

use crate::bridge::HostWorld;
use crate::types::EntityView;

#[derive(Debug, Clone)]
pub struct SimEntity {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    pub x: i64,
    pub y: i64,
    pub hp: i64,
    pub max_hp: i64,
    pub attack: i64,
    pub defense: i64,
    pub is_alive: bool,
    pub stats: BTreeMap<String, f64>,
}

impl SimEntity {
    pub fn new(id: &str, name: &str, entity_type: &str) -> SimEntity {
        SimEntity {
            id: id.to_string(),
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            x: 0,
            y: 0,
            hp: 10,
            max_hp: 10,
            attack: 1,
            defense: 0,
            is_alive: true,
            stats: BTreeMap::new(),
        }
    }

    pub fn at(mut self, x: i64, y: i64) -> SimEntity {
        self.x = x;
        self.y = y;
        self
    }

    pub fn vitals(mut self, hp: i64, max_hp: i64) -> SimEntity {
        self.hp = hp;
        self.max_hp = max_hp;
        self
    }

    pub fn combat(mut self, attack: i64, defense: i64) -> SimEntity {
        self.attack = attack;
        self.defense = defense;
        self
    }

    fn view(&self) -> EntityView {
        EntityView {
            id: self.id.clone(),
            name: self.name.clone(),
            entity_type: self.entity_type.clone(),
            x: self.x,
            y: self.y,
            hp: self.hp,
            max_hp: self.max_hp,
            attack: self.attack,
            defense: self.defense,
            is_alive: self.is_alive,
            stats: self.stats.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SimWorld {
    width: i64,
    height: i64,
    blocked: BTreeSet<(i64, i64)>,
    entities: BTreeMap<String, SimEntity>,
    player_id: Option<String>,
    turn: u64,
    floor: u32,
    messages: Vec<String>,
}

impl SimWorld {
    pub fn new(width: i64, height: i64) -> SimWorld {
        SimWorld {
            width,
            height,
            floor: 1,
            ..SimWorld::default()
        }
    }

    pub fn add_entity(&mut self, entity: SimEntity) {
        if entity.entity_type == "player" && self.player_id.is_none() {
            self.player_id = Some(entity.id.clone());
        }
        self.entities.insert(entity.id.clone(), entity);
    }

    pub fn remove_entity(&mut self, id: &str) {
        self.entities.remove(id);
    }

    pub fn set_blocked(&mut self, x: i64, y: i64) {
        self.blocked.insert((x, y));
    }

    pub fn set_turn(&mut self, turn: u64) {
        self.turn = turn;
    }

    pub fn advance_turn(&mut self) {
        self.turn += 1;
    }

    pub fn set_floor(&mut self, floor: u32) {
        self.floor = floor;
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn stat(&self, entity_id: &str, stat_name: &str) -> Option<f64> {
        self.entities
            .get(entity_id)
            .and_then(|entity| entity.stats.get(stat_name))
            .copied()
    }

    pub fn hp(&self, entity_id: &str) -> Option<i64> {
        self.entities.get(entity_id).map(|entity| entity.hp)
    }

    fn on_death(entity: &mut SimEntity) {
        entity.is_alive = false;
        // Scratch values belong to the lifetime of the agent.
        entity.stats.clear();
    }
}

impl HostWorld for SimWorld {
    fn player(&self) -> Option<EntityView> {
        self.player_id
            .as_deref()
            .and_then(|id| self.entities.get(id))
            .map(SimEntity::view)
    }

    fn entity(&self, id: &str) -> Option<EntityView> {
        self.entities.get(id).map(SimEntity::view)
    }

    fn entity_at(&self, x: i64, y: i64) -> Option<EntityView> {
        self.entities
            .values()
            .find(|entity| entity.is_alive && entity.x == x && entity.y == y)
            .map(SimEntity::view)
    }

    fn entities_in_range(&self, x: i64, y: i64, radius: f64) -> Vec<EntityView> {
        self.entities
            .values()
            .filter(|entity| {
                let dx = (entity.x - x) as f64;
                let dy = (entity.y - y) as f64;
                entity.is_alive && (dx * dx + dy * dy).sqrt() <= radius
            })
            .map(SimEntity::view)
            .collect()
    }

    fn entities_by_type(&self, entity_type: &str) -> Vec<EntityView> {
        self.entities
            .values()
            .filter(|entity| entity.entity_type == entity_type)
            .map(SimEntity::view)
            .collect()
    }

    fn is_walkable(&self, x: i64, y: i64) -> bool {
        self.in_bounds(x, y) && !self.blocked.contains(&(x, y))
    }

    fn in_bounds(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && x < self.width && y < self.height
    }

    fn turn_count(&self) -> u64 {
        self.turn
    }

    fn floor(&self) -> u32 {
        self.floor
    }

    fn modify_stat(&mut self, entity_id: &str, stat_name: &str, delta: f64) -> bool {
        match self.entities.get_mut(entity_id) {
            Some(entity) if entity.is_alive => {
                let slot = entity.stats.entry(stat_name.to_string()).or_insert(0.0);
                *slot += delta;
                true
            }
            _ => false,
        }
    }

    fn deal_damage(&mut self, entity_id: &str, amount: i64) -> i64 {
        let Some(entity) = self.entities.get_mut(entity_id) else {
            return 0;
        };
        if !entity.is_alive || amount <= 0 {
            return 0;
        }
        // A connecting hit always chips at least one point.
        let reduced = (amount - entity.defense).max(1);
        let actual = reduced.min(entity.hp);
        entity.hp -= actual;
        if entity.hp == 0 {
            SimWorld::on_death(entity);
        }
        actual
    }

    fn heal(&mut self, entity_id: &str, amount: i64) -> i64 {
        let Some(entity) = self.entities.get_mut(entity_id) else {
            return 0;
        };
        if !entity.is_alive || amount <= 0 {
            return 0;
        }
        let actual = amount.min(entity.max_hp - entity.hp);
        entity.hp += actual;
        actual
    }

    fn is_alive(&self, entity_id: &str) -> bool {
        self.entities
            .get(entity_id)
            .map(|entity| entity.is_alive)
            .unwrap_or(false)
    }

    fn push_message(&mut self, text: String) {
        self.messages.push(text);
    }
}
