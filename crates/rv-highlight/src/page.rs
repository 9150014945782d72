//! Per-page highlight context.

use crate::PassOutcome;
use crate::RecomputeScheduler;
use crate::Trigger;
use crate::compute_highlights;
use rv_core::RevisitResult;
use rv_dom::Document;
use rv_dom::NodeId;
use rv_ipc::ExtensionMessage;
use rv_ipc::LocalEndpoint;
use rv_storage::ExtensionStorage;
use std::collections::BTreeSet;
use tracing::debug;
use tracing::warn;

/// Owns one page's document and schedules highlight passes over it.
///
/// Storage is re-read at the start of every pass, so settings and history
/// written by other contexts take effect on the next frame.
pub struct PageContext {
    document: Document,
    storage: ExtensionStorage,
    scheduler: RecomputeScheduler,
    observed_revision: u64,
    highlighted: BTreeSet<NodeId>,
    passes: u64,
}

impl PageContext {
    /// Wraps a freshly loaded document and schedules the initial pass.
    pub fn load(document: Document, storage: ExtensionStorage) -> Self {
        let observed_revision = document.revision();
        let mut page = Self {
            document,
            storage,
            scheduler: RecomputeScheduler::new(),
            observed_revision,
            highlighted: BTreeSet::new(),
            passes: 0,
        };
        page.signal(Trigger::Load);
        page
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Mutable access for script-driven DOM changes. Tree edits are picked
    /// up on the next frame.
    pub fn document_mut(&mut self) -> &mut Document {
        &mut self.document
    }

    pub fn signal(&mut self, trigger: Trigger) -> bool {
        let scheduled = self.scheduler.trigger(trigger);
        debug!(?trigger, scheduled, "highlight trigger");
        scheduled
    }

    /// Reacts to runtime messages. Returns whether the message was relevant.
    pub fn handle_message(&mut self, message: ExtensionMessage) -> bool {
        match message {
            ExtensionMessage::UpdateHighlight | ExtensionMessage::UpdateSettings => {
                self.signal(Trigger::Message(message));
                true
            }
            ExtensionMessage::ReloadHistory | ExtensionMessage::ReloadDone => false,
        }
    }

    /// Feeds every queued message from `endpoint` into the page.
    pub fn drain_messages(&mut self, endpoint: &LocalEndpoint) -> RevisitResult<usize> {
        let mut received = 0_usize;
        while let Some(message) = endpoint.try_recv_message()? {
            self.handle_message(message);
            received += 1;
        }
        Ok(received)
    }

    /// In-page navigation: same document, new location.
    pub fn navigate(&mut self, url: &str) {
        self.document.set_url(url);
        self.signal(Trigger::Navigation);
    }

    /// Schedules a pass if the tree changed since the last check.
    pub fn observe_mutations(&mut self) -> bool {
        let revision = self.document.revision();
        if revision == self.observed_revision {
            return false;
        }
        self.observed_revision = revision;
        self.signal(Trigger::DomMutation);
        true
    }

    /// Runs the pending pass, if any.
    ///
    /// Failures end the pass and are logged; the page stays usable and the
    /// next trigger retries from fresh storage reads.
    pub fn on_animation_frame(&mut self) -> Option<PassOutcome> {
        self.observe_mutations();
        if !self.scheduler.take() {
            return None;
        }

        self.passes += 1;
        match self.run_pass() {
            Ok(outcome) => {
                if let PassOutcome::Applied(report) = &outcome {
                    self.highlighted.extend(report.highlighted.iter().copied());
                    debug!(
                        url = self.document.url(),
                        scanned = report.scanned,
                        highlighted = report.highlighted.len(),
                        style_changes = report.style_changes,
                        "highlight pass applied"
                    );
                }
                Some(outcome)
            }
            Err(error) => {
                warn!(url = self.document.url(), %error, "highlight pass failed");
                None
            }
        }
    }

    /// Links highlighted by any pass so far, in document order.
    pub fn highlighted_links(&self) -> Vec<NodeId> {
        self.document
            .links()
            .into_iter()
            .filter(|link| self.highlighted.contains(link))
            .collect()
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    fn run_pass(&mut self) -> RevisitResult<PassOutcome> {
        let state = self.storage.page_state()?;
        // Natively visited links still highlight on a page without a domain.
        let page_domain = rv_url::page_domain(self.document.url()).unwrap_or_else(|error| {
            debug!(url = self.document.url(), %error, "page has no domain label");
            String::new()
        });
        compute_highlights(
            &mut self.document,
            state.history.as_ref(),
            &state.settings,
            &page_domain,
        )
    }
}
