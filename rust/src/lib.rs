mod actions;
pub mod backend;
mod core;
mod error;
mod logging;
mod state;
mod tls;
mod updates;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use flume::{Receiver, Sender};

pub use actions::AppAction;
pub use backend::{Collaborators, MemoryHub};
pub use crate::core::{load_app_config, AppConfig, CONFIG_FILE_NAME};
pub use error::*;
pub use logging::init_logging;
pub use state::*;
pub use updates::*;

// Used by binaries that talk to the network without going through `ChatApp`.
pub fn init_rustls_crypto_provider() {
    tls::init_rustls_crypto_provider();
}

pub trait AppReconciler: Send + Sync + 'static {
    fn reconcile(&self, update: AppUpdate);
}

/// Handle to the app actor. Every call returns immediately; effects show up in the next
/// snapshot from [`ChatApp::state`] or the update listener.
pub struct ChatApp {
    core_tx: Sender<CoreMsg>,
    update_rx: Receiver<AppUpdate>,
    listening: AtomicBool,
    shared_state: Arc<RwLock<AppState>>,
}

impl ChatApp {
    pub fn new(data_dir: String, collaborators: Collaborators) -> Arc<Self> {
        // Must run before reqwest or the websocket transport opens a TLS connection.
        tls::init_rustls_crypto_provider();
        logging::init_logging(&data_dir);
        tracing::info!(data_dir = %data_dir, "ChatApp::new() starting");

        let (update_tx, update_rx) = flume::unbounded();
        let (core_tx, core_rx) = flume::unbounded::<CoreMsg>();
        let shared_state = Arc::new(RwLock::new(AppState::empty()));

        // Actor loop thread (single threaded "app actor").
        let core_tx_for_core = core_tx.clone();
        let shared_for_core = shared_state.clone();
        thread::spawn(move || {
            let mut core = match crate::core::AppCore::new(
                update_tx,
                core_tx_for_core,
                data_dir,
                shared_for_core,
                collaborators,
            ) {
                Ok(core) => core,
                Err(e) => {
                    tracing::error!(error = %format!("{e:#}"), "core init failed");
                    return;
                }
            };
            while let Ok(msg) = core_rx.recv() {
                core.handle_message(msg);
            }
        });

        Arc::new(Self {
            core_tx,
            update_rx,
            listening: AtomicBool::new(false),
            shared_state,
        })
    }

    /// Collaborators from `cognito_config.json`: REST + websocket when a backend is
    /// configured, otherwise a private in-memory hub.
    pub fn connect(data_dir: String) -> anyhow::Result<Arc<Self>> {
        let config = load_app_config(&data_dir);
        let collaborators = if config.network_enabled() {
            Collaborators::from_config(&config)?
        } else {
            Collaborators::in_memory(MemoryHub::new())
        };
        Ok(Self::new(data_dir, collaborators))
    }

    pub fn state(&self) -> AppState {
        match self.shared_state.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    pub fn dispatch(&self, action: AppAction) {
        // Contract: never block caller.
        let _ = self.core_tx.send(CoreMsg::Action(action));
    }

    pub fn listen_for_updates(&self, reconciler: Box<dyn AppReconciler>) {
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Avoid multiple listeners that would split messages.
            return;
        }

        let rx = self.update_rx.clone();
        thread::spawn(move || {
            while let Ok(update) = rx.recv() {
                reconciler.reconcile(update);
            }
        });
    }

    pub fn login(&self, user_id: impl Into<String>) {
        self.dispatch(AppAction::Login {
            user_id: user_id.into(),
        });
    }

    pub fn logout(&self) {
        self.dispatch(AppAction::Logout);
    }

    pub fn activate_group(&self, group_id: Option<String>) {
        self.dispatch(AppAction::ActivateGroup { group_id });
    }

    pub fn send_text(&self, content: impl Into<String>) {
        self.dispatch(AppAction::SendText {
            content: content.into(),
        });
    }

    pub fn send_media(&self, data: Vec<u8>, media_type: impl Into<String>) {
        self.dispatch(AppAction::SendMedia {
            data,
            media_type: media_type.into(),
            mime_type: None,
            filename: None,
        });
    }

    pub fn current_messages(&self) -> Vec<ChatMessage> {
        self.state().current_messages().to_vec()
    }

    pub fn unread_count(&self, group_id: &str) -> u32 {
        self.state().unread_count(group_id)
    }

    pub fn is_sending(&self) -> bool {
        self.state().busy.is_sending()
    }
}
