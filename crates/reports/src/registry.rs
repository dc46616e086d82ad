//! Report generator registry.
//!
//! Generators are registered per [`ReportView`] at startup; the controller
//! resolves incoming view names against this table and rejects unknown ones
//! before any task is created.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use stockview_core::{Report, ReportParams, ReportView};

use crate::controller::TaskHandle;
use crate::error::ControllerError;

/// A report generator: runs the query for one view and returns its rows.
pub type ReportGenerator =
    Arc<dyn Fn(&ReportParams, &TaskHandle) -> anyhow::Result<Report> + Send + Sync>;

#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    generators: HashMap<ReportView, ReportGenerator>,
}

impl fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratorRegistry")
            .field("views", &self.views())
            .finish()
    }
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the generator of `view`.
    pub fn register<F>(&mut self, view: ReportView, generator: F) -> &mut Self
    where
        F: Fn(&ReportParams, &TaskHandle) -> anyhow::Result<Report> + Send + Sync + 'static,
    {
        self.generators.insert(view, Arc::new(generator));
        self
    }

    /// Builder form of [`Self::register`].
    pub fn with<F>(mut self, view: ReportView, generator: F) -> Self
    where
        F: Fn(&ReportParams, &TaskHandle) -> anyhow::Result<Report> + Send + Sync + 'static,
    {
        self.register(view, generator);
        self
    }

    pub fn get(&self, view: ReportView) -> Option<ReportGenerator> {
        self.generators.get(&view).cloned()
    }

    pub fn contains(&self, view: ReportView) -> bool {
        self.generators.contains_key(&view)
    }

    /// Parse `view_name` and look up its generator.
    pub fn resolve(&self, view_name: &str) -> Result<(ReportView, ReportGenerator), ControllerError> {
        let view = ReportView::from_str(view_name)
            .map_err(|_| ControllerError::UnknownView(view_name.to_string()))?;
        let generator = self
            .get(view)
            .ok_or_else(|| ControllerError::UnknownView(view_name.to_string()))?;
        Ok((view, generator))
    }

    /// Registered views in catalogue order.
    pub fn views(&self) -> Vec<ReportView> {
        ReportView::ALL
            .into_iter()
            .filter(|v| self.generators.contains_key(v))
            .collect()
    }
}
