//! Connection to the audio engine and its reconnect policy.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Result;
use crate::privilege::PrivilegeGate;
use crate::signals::ControlSignals;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connected,
    ReconnectPending,
}

/// Handed to the engine so its callbacks can reach the link and the control loop.
///
/// Callbacks run on the engine's thread and only flip flags or wake the loop.
#[derive(Clone)]
pub struct EngineNotifier {
    server_gone: Arc<AtomicBool>,
    signals: Arc<ControlSignals>,
}

impl EngineNotifier {
    /// The server shut down or kicked this client.
    pub fn server_shutdown(&self) {
        log::info!("audio server shutdown received");
        self.server_gone.store(true, Ordering::SeqCst);
        self.signals.trigger();
    }

    /// Graph order or topology changed; re-evaluate without waiting for the next tick.
    pub fn graph_changed(&self) {
        log::trace!("graph change trigger");
        self.signals.trigger();
    }
}

/// An audio engine the daemon can connect to.
pub trait AudioEngine {
    type Session: EngineSession;

    fn connect(&mut self, notifier: EngineNotifier) -> Result<Self::Session>;
}

/// An established client connection.
pub trait EngineSession {
    /// Instantaneous DSP load, percent.
    fn dsp_load(&self) -> f32;

    fn close(self);
}

pub struct AudioLink<E: AudioEngine> {
    engine: E,
    session: Option<E::Session>,
    state: LinkState,
    reconnect: bool,
    gate: PrivilegeGate,
    server_gone: Arc<AtomicBool>,
    signals: Arc<ControlSignals>,
}

impl<E: AudioEngine> AudioLink<E> {
    pub fn new(
        engine: E,
        gate: PrivilegeGate,
        reconnect: bool,
        signals: Arc<ControlSignals>,
    ) -> Self {
        Self {
            engine,
            session: None,
            state: LinkState::Disconnected,
            reconnect,
            gate,
            server_gone: Arc::new(AtomicBool::new(false)),
            signals,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Connects as the server owner. With reconnect enabled a failure leaves the link
    /// pending, otherwise the state is unchanged.
    pub fn connect(&mut self) -> Result<()> {
        self.server_gone.store(false, Ordering::SeqCst);
        let notifier = EngineNotifier {
            server_gone: self.server_gone.clone(),
            signals: self.signals.clone(),
        };
        let engine = &mut self.engine;
        let session = match self
            .gate
            .connect_as_owner(|| engine.connect(notifier))
            .and_then(|connected| connected)
        {
            Ok(session) => session,
            Err(e) => {
                if self.reconnect {
                    self.state = LinkState::ReconnectPending;
                }
                return Err(e);
            }
        };
        self.session = Some(session);
        self.state = LinkState::Connected;
        log::info!("connected to the audio server");
        Ok(())
    }

    /// Applies a pending shutdown notification.
    fn observe_events(&mut self) {
        if self.state != LinkState::Connected || !self.server_gone.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(session) = self.session.take() {
            session.close();
        }
        if self.reconnect {
            log::info!("audio server gone, will reconnect");
            self.state = LinkState::ReconnectPending;
        } else {
            log::warn!("audio server gone, exiting");
            self.state = LinkState::Disconnected;
            self.signals.request_shutdown();
        }
    }

    /// DSP load of the current cycle, `None` when no connection could be made.
    pub fn poll_load(&mut self) -> Option<f32> {
        self.observe_events();
        if self.state != LinkState::Connected {
            if !self.reconnect {
                return None;
            }
            if let Err(e) = self.connect() {
                log::debug!("{e}");
                return None;
            }
        }
        self.session.as_ref().map(EngineSession::dsp_load)
    }

    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
            log::info!("disconnected from the audio server");
        }
        self.state = LinkState::Disconnected;
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeEngine;
    use super::*;
    use crate::privilege::testing::RecordingIdentity;
    use crate::privilege::{PrivilegeContext, PrivilegeGate};
    use crate::signals::Wake;
    use nix::unistd::{Gid, Uid};
    use std::time::Duration;

    fn link(engine: &FakeEngine, reconnect: bool) -> (AudioLink<FakeEngine>, Arc<ControlSignals>) {
        let signals = Arc::new(ControlSignals::new());
        let gate = PrivilegeGate::new(None, Box::new(RecordingIdentity::default()));
        (
            AudioLink::new(engine.clone(), gate, reconnect, signals.clone()),
            signals,
        )
    }

    #[test]
    fn test_connect_and_poll() {
        let engine = FakeEngine::with_load(12.5);
        let (mut link, _) = link(&engine, false);
        assert_eq!(link.state(), LinkState::Disconnected);
        link.connect().unwrap();
        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(link.poll_load(), Some(12.5));
    }

    #[test]
    fn test_shutdown_with_reconnect_goes_pending_then_reconnects() {
        let engine = FakeEngine::with_load(30.0);
        let (mut link, signals) = link(&engine, true);
        link.connect().unwrap();

        engine.notifier().server_shutdown();
        assert_eq!(signals.wait(Duration::from_secs(1)), Wake::Triggered);

        engine.fail_next(1);
        assert_eq!(link.poll_load(), None);
        assert_eq!(link.state(), LinkState::ReconnectPending);
        assert_eq!(engine.connects(), 2);

        // next poll reconnects before sampling
        assert_eq!(link.poll_load(), Some(30.0));
        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(engine.connects(), 3);
        assert!(!signals.shutdown_requested());
    }

    #[test]
    fn test_shutdown_without_reconnect_requests_exit() {
        let engine = FakeEngine::with_load(30.0);
        let (mut link, signals) = link(&engine, false);
        link.connect().unwrap();

        engine.notifier().server_shutdown();
        assert_eq!(link.poll_load(), None);
        assert_eq!(link.state(), LinkState::Disconnected);
        assert!(signals.shutdown_requested());
        assert_eq!(engine.connects(), 1);
    }

    #[test]
    fn test_unbounded_retries() {
        let engine = FakeEngine::with_load(1.0);
        let (mut link, _) = link(&engine, true);
        engine.fail_next(5);
        for _ in 0..5 {
            assert_eq!(link.poll_load(), None);
            assert_eq!(link.state(), LinkState::ReconnectPending);
        }
        assert_eq!(link.poll_load(), Some(1.0));
        assert_eq!(engine.connects(), 6);
    }

    #[test]
    fn test_disconnected_without_reconnect_never_connects() {
        let engine = FakeEngine::default();
        let (mut link, _) = link(&engine, false);
        assert_eq!(link.poll_load(), None);
        assert_eq!(engine.connects(), 0);
    }

    #[test]
    fn test_graph_change_wakes_without_state_change() {
        let engine = FakeEngine::default();
        let (mut link, signals) = link(&engine, true);
        link.connect().unwrap();
        engine.notifier().graph_changed();
        assert_eq!(signals.wait(Duration::from_secs(1)), Wake::Triggered);
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[test]
    fn test_connect_is_privilege_gated() {
        let engine = FakeEngine::default();
        let identity = RecordingIdentity::default();
        let ctx = PrivilegeContext {
            uid: Uid::from_raw(1000),
            gid: Gid::from_raw(1000),
        };
        let gate = PrivilegeGate::new(Some(ctx), Box::new(identity.clone()));
        let mut link = AudioLink::new(engine.clone(), gate, true, Arc::new(ControlSignals::new()));

        engine.fail_next(1);
        assert!(link.connect().is_err());
        link.connect().unwrap();
        assert_eq!(
            identity.entries(),
            vec!["assume 1000:1000", "restore", "assume 1000:1000", "restore"]
        );
    }

    #[test]
    fn test_close() {
        let engine = FakeEngine::default();
        let (mut link, _) = link(&engine, true);
        link.connect().unwrap();
        link.close();
        assert_eq!(link.state(), LinkState::Disconnected);
    }
}
