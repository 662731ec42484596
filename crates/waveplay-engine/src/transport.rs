//! JACK front end: one client exposing a stereo output pair per player
//! slot plus a shared MIDI input, with the engine doing all rendering.

use std::sync::Arc;

use anyhow::{Context, Result};
use jack::{AudioOut, Client, ClientOptions, Control, MidiIn, Port, ProcessScope};

use crate::config;
use crate::engine::Engine;

/// Keeps the JACK client active. Drop this to disconnect from the server;
/// the engine and its players outlive the connection.
pub struct Transport {
    _async_client: jack::AsyncClient<Notifications, Processor>,
    name: String,
    sample_rate: u32,
    buffer_size: u32,
}

impl Transport {
    /// Connect to a running JACK server and start the realtime callback.
    ///
    /// Registers `out_01a`/`out_01b` through `out_17a`/`out_17b` and a MIDI
    /// `in` port, and locks the engine's output rate to the server rate
    /// before any audio flows.
    pub fn start(engine: Arc<Engine>, client_name: &str) -> Result<Transport> {
        let (client, _status) = Client::new(client_name, ClientOptions::NO_START_SERVER)
            .context("create jack client")?;
        let name = client.name().to_string();
        let sample_rate = client.sample_rate() as u32;
        let buffer_size = client.buffer_size();

        engine.set_output_rate(sample_rate);

        let mut pairs = Vec::with_capacity(config::MAX_PLAYERS);
        for slot in 0..config::MAX_PLAYERS {
            let a = client
                .register_port(&format!("out_{:02}a", slot + 1), AudioOut::default())
                .context("register output port")?;
            let b = client
                .register_port(&format!("out_{:02}b", slot + 1), AudioOut::default())
                .context("register output port")?;
            pairs.push((a, b));
        }
        let midi_in = client
            .register_port("in", MidiIn::default())
            .context("register midi port")?;

        let processor = Processor {
            pairs,
            midi_in,
            engine: Arc::clone(&engine),
        };
        let async_client = client
            .activate_async(Notifications { engine }, processor)
            .context("activate jack client")?;

        tracing::info!(
            client = %name,
            rate = sample_rate,
            frames = buffer_size,
            "audio transport online"
        );
        Ok(Transport {
            _async_client: async_client,
            name,
            sample_rate,
            buffer_size,
        })
    }

    /// Name the server assigned, which may differ from the requested one.
    pub fn client_name(&self) -> &str {
        &self.name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Period length in frames.
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    pub fn latency_ms(&self) -> f32 {
        self.buffer_size as f32 / self.sample_rate as f32 * 1000.0
    }
}

struct Processor {
    pairs: Vec<(Port<AudioOut>, Port<AudioOut>)>,
    midi_in: Port<MidiIn>,
    engine: Arc<Engine>,
}

impl jack::ProcessHandler for Processor {
    fn process(&mut self, _client: &Client, ps: &ProcessScope) -> Control {
        for (slot, (a, b)) in self.pairs.iter_mut().enumerate() {
            self.engine
                .process_player(slot, a.as_mut_slice(ps), b.as_mut_slice(ps));
        }
        // Notes and controls drained after rendering take effect from the
        // next period.
        for event in self.midi_in.iter(ps) {
            self.engine.process_midi(event.bytes);
        }
        Control::Continue
    }
}

struct Notifications {
    engine: Arc<Engine>,
}

impl jack::NotificationHandler for Notifications {
    fn sample_rate(&mut self, _client: &Client, srate: jack::Frames) -> Control {
        tracing::info!(rate = srate, "server sample rate changed");
        self.engine.set_output_rate(srate);
        Control::Continue
    }

    fn xrun(&mut self, _client: &Client) -> Control {
        tracing::warn!("xrun detected");
        Control::Continue
    }
}
