//! JACK implementation of the audio engine (also served by PipeWire's JACK layer).

use jack::{AsyncClient, Client, ClientOptions, ClientStatus, Control, NotificationHandler};

use crate::audio_link::{AudioEngine, EngineNotifier, EngineSession};
use crate::error::{Error, Result};

pub struct JackEngine {
    client_name: String,
}

impl JackEngine {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
        }
    }
}

pub struct Notifications(EngineNotifier);

impl NotificationHandler for Notifications {
    fn shutdown(&mut self, _status: ClientStatus, _reason: &str) {
        self.0.server_shutdown();
    }

    fn graph_reorder(&mut self, _: &Client) -> Control {
        self.0.graph_changed();
        Control::Continue
    }
}

pub struct JackSession(AsyncClient<Notifications, ()>);

impl EngineSession for JackSession {
    fn dsp_load(&self) -> f32 {
        self.0.as_client().cpu_load()
    }

    fn close(self) {
        if let Err(e) = self.0.deactivate() {
            log::warn!("cannot deactivate JACK client: {e}");
        }
    }
}

impl AudioEngine for JackEngine {
    type Session = JackSession;

    fn connect(&mut self, notifier: EngineNotifier) -> Result<JackSession> {
        let (client, status) = Client::new(&self.client_name, ClientOptions::NO_START_SERVER)
            .map_err(|e| Error::Connect(e.to_string()))?;
        log::debug!("jack_client_open status = {status:?}");
        let active = client
            .activate_async(Notifications(notifier), ())
            .map_err(|e| Error::Connect(format!("cannot activate client: {e}")))?;
        Ok(JackSession(active))
    }
}
