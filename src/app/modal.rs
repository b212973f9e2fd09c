// src/app/modal.rs
// Modal overlay elements and the stack of open modal apps

use super::types::{AppId, LoadedApp};
use crate::error::{PortalError, Result};
use crate::host::{Dom, ElementId};
use std::fmt;
use std::sync::Arc;

pub const MODAL_OVERLAY_ID: &str = "portal-modal-overlay";
pub const MODAL_OVERLAY_APP_ID: &str = "portal-modal-overlay-app";
pub const MODAL_OVERLAY_TITLE_ID: &str = "portal-modal-overlay-title";

/// Called instead of unloading when a modal is closed
pub type ModalCloseCallback = Arc<dyn Fn(&LoadedApp) + Send + Sync>;

/// The overlay elements the page template provides
#[derive(Debug, Clone, Copy)]
pub(crate) struct ModalOverlay {
    pub overlay: ElementId,
    pub app_area: ElementId,
    pub title: Option<ElementId>,
}

impl ModalOverlay {
    pub fn find(dom: &dyn Dom) -> Result<Self> {
        let overlay = dom
            .element_by_id(MODAL_OVERLAY_ID)
            .ok_or(PortalError::ModalOverlayMissing)?;
        let app_area = dom
            .element_by_id(MODAL_OVERLAY_APP_ID)
            .ok_or(PortalError::ModalOverlayMissing)?;
        Ok(Self {
            overlay,
            app_area,
            title: dom.element_by_id(MODAL_OVERLAY_TITLE_ID),
        })
    }

    pub fn show(&self, dom: &dyn Dom, title: &str) {
        if let Some(el) = self.title {
            dom.set_text(el, title);
        }
        dom.set_visible(self.overlay, true);
    }

    pub fn hide(&self, dom: &dyn Dom) {
        dom.set_visible(self.overlay, false);
    }
}

#[derive(Clone)]
pub(crate) struct OpenModal {
    pub app_id: AppId,
    pub wrapper: ElementId,
    pub title: String,
    pub on_close: Option<ModalCloseCallback>,
}

impl fmt::Debug for OpenModal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenModal")
            .field("app_id", &self.app_id)
            .field("title", &self.title)
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

/// Open modals, top of the stack last. Only the top is visible.
#[derive(Debug, Default)]
pub(crate) struct ModalStack {
    entries: Vec<OpenModal>,
}

impl ModalStack {
    /// Hide the current top and show `modal`
    pub fn push(&mut self, dom: &dyn Dom, overlay: &ModalOverlay, modal: OpenModal) {
        if let Some(top) = self.entries.last() {
            dom.set_visible(top.wrapper, false);
        }
        dom.set_visible(modal.wrapper, true);
        overlay.show(dom, &modal.title);
        self.entries.push(modal);
    }

    pub fn top(&self) -> Option<&OpenModal> {
        self.entries.last()
    }

    /// Remove the entry of `app_id` wherever it is and fix up visibility
    pub fn remove(&mut self, dom: &dyn Dom, app_id: &AppId) -> Option<OpenModal> {
        let index = self.entries.iter().position(|m| &m.app_id == app_id)?;
        let removed = self.entries.remove(index);
        self.restore_top(dom);
        Some(removed)
    }

    /// Replace the wrapper of an open modal after a reload
    pub fn update_wrapper(&mut self, dom: &dyn Dom, app_id: &AppId, wrapper: ElementId) {
        let is_top = self.top().map(|m| &m.app_id == app_id).unwrap_or(false);
        if let Some(entry) = self.entries.iter_mut().find(|m| &m.app_id == app_id) {
            entry.wrapper = wrapper;
            dom.set_visible(wrapper, is_top);
        }
    }

    fn restore_top(&self, dom: &dyn Dom) {
        let Ok(overlay) = ModalOverlay::find(dom) else {
            return;
        };
        match self.entries.last() {
            Some(top) => {
                dom.set_visible(top.wrapper, true);
                overlay.show(dom, &top.title);
            }
            None => overlay.hide(dom),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn app_ids(&self) -> Vec<AppId> {
        self.entries.iter().map(|m| m.app_id.clone()).collect()
    }
}
