use std::sync::Arc;

use parking_lot::Mutex;

use super::AutomationRule;
use crate::error::{Error, Result};
use crate::store::{Settings, Store};
use crate::tracing::prelude::*;

/// Gatekeeper for rule and settings changes.
///
/// Price-threshold rules and auto-optimization both drive device modes
/// from the energy price and must not be active together. Every change
/// that could activate one of them goes through here, and the check and
/// the write happen under one lock so two concurrent activations cannot
/// both pass. A rejected change leaves the store untouched.
pub struct RuleBook {
    store: Arc<dyn Store>,
    guard: Mutex<()>,
}

impl RuleBook {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            guard: Mutex::new(()),
        }
    }

    fn check_rule(&self, rule: &AutomationRule) -> Result<()> {
        rule.validate()?;
        if rule.is_active_price_rule() && self.store.settings().auto_optimize {
            return Err(Error::Conflict(format!(
                "rule {} is a price-threshold rule and auto-optimization is enabled",
                rule.name
            )));
        }
        Ok(())
    }

    pub fn create(&self, rule: AutomationRule) -> Result<AutomationRule> {
        let _guard = self.guard.lock();
        if self.store.rule(&rule.name).is_some() {
            return Err(Error::Conflict(format!("rule {} already exists", rule.name)));
        }
        self.check_rule(&rule)?;
        info!(rule = %rule.name, "Rule created");
        self.store.upsert_rule(rule.clone());
        Ok(rule)
    }

    /// Replace an existing rule.
    pub fn update(&self, rule: AutomationRule) -> Result<AutomationRule> {
        let _guard = self.guard.lock();
        if self.store.rule(&rule.name).is_none() {
            return Err(Error::not_found("rule", &rule.name));
        }
        self.check_rule(&rule)?;
        info!(rule = %rule.name, "Rule updated");
        self.store.upsert_rule(rule.clone());
        Ok(rule)
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<AutomationRule> {
        let _guard = self.guard.lock();
        let mut rule = self
            .store
            .rule(name)
            .ok_or_else(|| Error::not_found("rule", name))?;
        rule.enabled = enabled;
        self.check_rule(&rule)?;
        info!(rule = %name, enabled, "Rule toggled");
        self.store.upsert_rule(rule.clone());
        Ok(rule)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let _guard = self.guard.lock();
        self.store.remove_rule(name)
    }

    /// Turn price-based optimization on or off.
    pub fn set_auto_optimize(&self, enabled: bool) -> Result<Settings> {
        self.update_settings(|settings| settings.auto_optimize = enabled)
    }

    /// Apply a settings change, re-checking the mutual exclusion.
    pub fn update_settings(&self, change: impl FnOnce(&mut Settings)) -> Result<Settings> {
        let _guard = self.guard.lock();
        let mut settings = self.store.settings();
        let was_enabled = settings.auto_optimize;
        change(&mut settings);

        if settings.auto_optimize && !was_enabled {
            let conflicting: Vec<_> = self
                .store
                .rules()
                .into_iter()
                .filter(AutomationRule::is_active_price_rule)
                .map(|r| r.name)
                .collect();
            if !conflicting.is_empty() {
                return Err(Error::Conflict(format!(
                    "auto-optimization conflicts with enabled price-threshold rules: {}",
                    conflicting.join(", ")
                )));
            }
        }

        if settings.auto_optimize != was_enabled {
            info!(auto_optimize = settings.auto_optimize, "Auto-optimization toggled");
        }
        self.store.put_settings(settings);
        Ok(settings)
    }
}
