//! In-memory cursor over one session and its checked-out iteration.
//!
//! The store alone cannot guarantee a single current pointer per session or
//! the undo rules; the manager enforces them. Every mutation writes to the
//! store first and only then updates in-memory state, so a failed call leaves
//! the cursor exactly where it was.
//!
//! Not safe for concurrent mutation. Share the [`Store`] instead when several
//! workflows need the database at once.

use super::types::{Iteration, NewIteration, Session};
use crate::config::Config;
use crate::cost::{CostEntry, CostSummary, DailyCost, ProviderCostSummary};
use crate::db::Store;
use crate::error::{Error, ResultExt};
use crate::util::timestamp_now;
use crate::Result;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

pub struct SessionManager {
    store: Store,
    images_dir: PathBuf,
    image_format: String,
    default_model: String,
    session: Option<Session>,
    current: Option<Iteration>,
}

impl SessionManager {
    pub fn new(
        store: Store,
        images_dir: impl Into<PathBuf>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            store,
            images_dir: images_dir.into(),
            image_format: "png".to_string(),
            default_model: default_model.into(),
            session: None,
            current: None,
        }
    }

    /// Open the configured database and build a manager with no active session.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = Store::open(&config.database_path())?;
        Ok(Self::new(store, config.images_dir(), config.default_model.clone())
            .with_image_format(config.image_format.clone()))
    }

    /// Extension used by [`image_path`](Self::image_path).
    #[must_use]
    pub fn with_image_format(mut self, format: impl Into<String>) -> Self {
        let format = format.into();
        self.image_format = format.trim_start_matches('.').to_string();
        self
    }

    // ── Cursor lifecycle ──────────────────────────────────────────

    /// Create, persist and activate a new session.
    ///
    /// The image directory is provisioned before the row is written; an
    /// existing directory is fine.
    pub fn start_new(&mut self, name: Option<&str>) -> Result<Session> {
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        let session = Session::new(name, self.default_model.clone());

        let dir = self.images_dir.join(&session.id);
        std::fs::create_dir_all(&dir).with_context(|| {
            format!("failed to create image directory {}", dir.display())
        })?;
        self.store.create_session(&session)?;

        tracing::info!(session_id = %session.id, name = %session.display_name(), "started session");
        self.session = Some(session.clone());
        self.current = None;
        Ok(session)
    }

    /// Replace in-memory state with a persisted session and its current iteration.
    pub fn load(&mut self, id: &str) -> Result<Session> {
        let session = self.store.get_session(id)?;
        let current = match session.current_iteration_id.as_deref() {
            Some(iteration_id) => Some(self.store.get_iteration(iteration_id)?),
            None => None,
        };

        tracing::info!(session_id = %session.id, name = %session.display_name(), "loaded session");
        self.session = Some(session.clone());
        self.current = current;
        Ok(session)
    }

    /// Start an unnamed session unless one is already active.
    pub fn ensure_session(&mut self) -> Result<&Session> {
        if self.session.is_none() {
            self.start_new(None)?;
        }
        self.session.as_ref().ok_or(Error::NoSession)
    }

    /// Record a new iteration as a child of the current one and check it out.
    ///
    /// When the cursor was moved back by [`undo`](Self::undo), the new
    /// iteration starts a branch; iterations ahead of the old position stay
    /// stored and visible in [`history`](Self::history).
    pub fn add_iteration(&mut self, new: NewIteration) -> Result<Iteration> {
        let session = self.ensure_session()?.clone();

        let model = if !new.model.is_empty() {
            new.model
        } else if !session.model.is_empty() {
            session.model.clone()
        } else {
            self.default_model.clone()
        };

        let now = timestamp_now();
        let iteration = Iteration {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            parent_id: self.current.as_ref().map(|c| c.id.clone()),
            operation: new.operation,
            prompt: new.prompt,
            revised_prompt: new.revised_prompt,
            model,
            image_path: new.image_path,
            timestamp: now,
            metadata: new.metadata,
        };

        let mut updated = session;
        updated.current_iteration_id = Some(iteration.id.clone());
        updated.updated_at = now;
        self.store.append_iteration(&iteration, &updated)?;

        tracing::debug!(
            iteration_id = %iteration.id,
            parent_id = ?iteration.parent_id,
            operation = %iteration.operation,
            "checked out new iteration"
        );
        self.session = Some(updated);
        self.current = Some(iteration.clone());
        Ok(iteration)
    }

    /// Move the current pointer to the parent iteration and return it.
    pub fn undo(&mut self) -> Result<Iteration> {
        let current = self.current.as_ref().ok_or(Error::NoIteration)?;
        let parent_id = current.parent_id.clone().ok_or(Error::AtFirstImage)?;
        let session = self.session.as_ref().ok_or(Error::NoSession)?;

        let parent = self.store.get_iteration(&parent_id)?;
        let mut updated = session.clone();
        updated.current_iteration_id = Some(parent.id.clone());
        updated.updated_at = timestamp_now();
        self.store.update_session(&updated)?;

        tracing::debug!(iteration_id = %parent.id, "undo");
        self.session = Some(updated);
        self.current = Some(parent.clone());
        Ok(parent)
    }

    /// Every iteration of the active session, oldest first.
    ///
    /// Flat listing, not a walk of the parent chain. Empty when no session is
    /// active.
    pub fn history(&self) -> Result<Vec<Iteration>> {
        match &self.session {
            Some(session) => self.store.list_iterations(&session.id),
            None => Ok(Vec::new()),
        }
    }

    /// Set or clear (blank name) the active session's label.
    pub fn rename_session(&mut self, name: &str) -> Result<()> {
        let session = self.session.as_ref().ok_or(Error::NoSession)?;
        let trimmed = name.trim();

        let mut updated = session.clone();
        updated.name = (!trimmed.is_empty()).then(|| trimmed.to_string());
        updated.updated_at = timestamp_now();
        self.store.update_session(&updated)?;

        tracing::debug!(session_id = %updated.id, name = ?updated.name, "renamed session");
        self.session = Some(updated);
        Ok(())
    }

    /// Change the default model, and the active session's model if there is one.
    pub fn set_model(&mut self, model: &str) -> Result<()> {
        let model = model.trim();
        if model.is_empty() {
            return Err(Error::InvalidInput("model name must not be empty".into()));
        }

        if let Some(session) = &self.session {
            let mut updated = session.clone();
            updated.model = model.to_string();
            updated.updated_at = timestamp_now();
            self.store.update_session(&updated)?;
            self.session = Some(updated);
        }

        tracing::debug!(model, "model changed");
        self.default_model = model.to_string();
        Ok(())
    }

    /// Model new iterations will use: the active session's, else the default.
    pub fn model(&self) -> &str {
        match &self.session {
            Some(session) if !session.model.is_empty() => &session.model,
            _ => &self.default_model,
        }
    }

    /// Delete a session and everything it owns. Resets the cursor when the
    /// deleted session is the active one.
    pub fn delete_session(&mut self, id: &str) -> Result<()> {
        let result = self.store.delete_session(id);
        let active = self.session.as_ref().is_some_and(|s| s.id == id);
        // The row may already be gone through another handle; the cursor
        // must not keep pointing at it either way.
        if active && result.as_ref().map_or_else(Error::is_not_found, |_| true) {
            self.session = None;
            self.current = None;
        }
        result?;
        tracing::info!(session_id = %id, "deleted session");
        Ok(())
    }

    // ── Cost ──────────────────────────────────────────────────────

    /// Append a ledger row for a billable call that produced `iteration`.
    pub fn log_cost(
        &self,
        iteration: &Iteration,
        provider: &str,
        cost: f64,
        image_count: u32,
    ) -> Result<i64> {
        let entry = CostEntry::new(
            iteration.id.clone(),
            iteration.session_id.clone(),
            provider,
            iteration.model.clone(),
            cost,
            image_count,
        );
        self.store.log_cost(&entry)
    }

    pub fn get_cost_by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<CostSummary> {
        self.store.get_cost_by_date_range(start, end)
    }

    pub fn get_cost_by_provider(&self) -> Result<Vec<ProviderCostSummary>> {
        self.store.get_cost_by_provider()
    }

    pub fn get_total_cost(&self) -> Result<CostSummary> {
        self.store.get_total_cost()
    }

    pub fn get_daily_costs(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DailyCost>> {
        self.store.get_daily_costs(start, end)
    }

    /// Spend of the active session; zero when none is active.
    pub fn get_session_cost(&self) -> Result<CostSummary> {
        match &self.session {
            Some(session) => self.store.get_session_cost(&session.id),
            None => Ok(CostSummary::default()),
        }
    }

    // ── Paths ─────────────────────────────────────────────────────

    /// Image directory of the active session.
    pub fn session_dir(&self) -> Option<PathBuf> {
        self.session.as_ref().map(|s| self.images_dir.join(&s.id))
    }

    /// Allocate a fresh, timestamp-named path for the next image.
    ///
    /// Pure path arithmetic: nothing is created on disk. A short random
    /// suffix keeps paths unique when called twice in one microsecond.
    pub fn image_path(&self) -> Option<PathBuf> {
        let dir = self.session_dir()?;
        let stamp = timestamp_now().format("%Y%m%d_%H%M%S_%6f");
        let mut suffix = uuid::Uuid::new_v4().simple().to_string();
        suffix.truncate(8);
        Some(dir.join(format!("{stamp}_{suffix}.{}", self.image_format)))
    }

    /// Image of the checked-out iteration.
    pub fn current_image_path(&self) -> Option<PathBuf> {
        self.current
            .as_ref()
            .filter(|it| !it.image_path.is_empty())
            .map(|it| PathBuf::from(&it.image_path))
    }

    // ── Accessors ─────────────────────────────────────────────────

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn current_iteration(&self) -> Option<&Iteration> {
        self.current.as_ref()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }
}
