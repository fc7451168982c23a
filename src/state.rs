//! # Application State
//!
//! Shared by every HTTP handler and WebSocket actor.
//!
//! ## Contents:
//! - **config**: runtime-editable configuration; the next connect picks up changes
//! - **bridge**: handle to the bridge task (commands, status, history, events)
//! - **start_time**: for uptime reporting
//!
//! `Arc<RwLock<AppConfig>>` lets many handlers read the configuration at once
//! while a `PUT /config` takes the write lock only for the swap.

use crate::bridge::BridgeHandle;
use crate::config::AppConfig;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub bridge: BridgeHandle,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, bridge: BridgeHandle) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            bridge,
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration; the lock is released on return.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration if it validates.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
