// Shoal
// Copyright (C) 2021  Wesley Merkel
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Outbound OSC.
//!
//! [`OscHandler`] sends arbitrary messages to a UDP peer. [`SuperDirtHandler`] speaks the
//! `/dirt/play` dialect understood by SuperDirt. Both send timetagged bundles stamped a little
//! ahead of the moment they are written, so the receiver can schedule them sample-accurately.

use crate::{
    event::{Event, EventKind, EventKinds},
    handler::{self, Handler},
    midi::Picker,
    pattern::{Param, ParseError},
    runner::Cycle,
    Environment,
};
use rosc::{encoder::encode, OscBundle, OscError, OscMessage, OscPacket, OscTime, OscType};
use std::{
    collections::BTreeMap,
    error, fmt, io,
    net::{ToSocketAddrs, UdpSocket},
    sync::{Arc, Mutex, Weak},
    time::{Duration, SystemTime},
};

/// Default address of SuperDirt.
pub const SUPERDIRT_ADDR: &str = "127.0.0.1:57120";

/// How far ahead of sending a bundle is stamped by default.
pub const DEFAULT_AHEAD: Duration = Duration::from_millis(300);

const DIRT_PLAY: &str = "/dirt/play";

/// Short parameter names and the SuperDirt parameters they stand for.
const ALIASES: &[(&str, &str)] = &[
    ("lpf", "cutoff"),
    ("lpq", "resonance"),
    ("hpf", "hcutoff"),
    ("bpf", "bandf"),
    ("bpq", "bandq"),
    ("res", "resonance"),
    ("midi", "midinote"),
    ("n", "midinote"),
    ("oct", "octave"),
    ("accel", "accelerate"),
    ("leg", "legato"),
    ("delayt", "delaytime"),
    ("delayfb", "delayfeedback"),
    ("phasr", "phaserrate"),
    ("phasd", "phaserdepth"),
    ("tremrate", "tremolorate"),
    ("tremd", "tremolodepth"),
    ("dist", "distort"),
];

/// The SuperDirt name of a parameter.
pub fn alias(name: &str) -> &str {
    ALIASES
        .iter()
        .find(|(short, _)| *short == name)
        .map(|(_, long)| *long)
        .unwrap_or(name)
}

/// An error that occurs while talking to an OSC peer.
#[derive(Debug)]
pub struct Error(ErrorInner);

#[derive(Debug)]
enum ErrorInner {
    UdpBind(io::Error),
    UdpConnect(io::Error),
    Send(io::Error),
    OscEncode(OscError),
}

/// Result type for OSC operations.
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            ErrorInner::UdpBind(e) => write!(f, "binding to UDP socket: {}", e),
            ErrorInner::UdpConnect(e) => write!(f, "connecting UDP socket to peer: {}", e),
            ErrorInner::Send(e) => write!(f, "sending packet to peer: {}", e),
            ErrorInner::OscEncode(e) => write!(f, "encoding OSC packet: {:?}", e),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.0 {
            ErrorInner::UdpBind(e) => Some(e),
            ErrorInner::UdpConnect(e) => Some(e),
            ErrorInner::Send(e) => Some(e),
            ErrorInner::OscEncode(_) => None,
        }
    }
}

/// A UDP socket connected to one OSC peer.
#[derive(Debug)]
pub struct OscClient {
    socket: UdpSocket,
}

impl OscClient {
    /// Connects to the peer at `addr`.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<OscClient> {
        let socket =
            UdpSocket::bind("0.0.0.0:0").map_err(|err| Error(ErrorInner::UdpBind(err)))?;
        socket
            .connect(addr)
            .map_err(|err| Error(ErrorInner::UdpConnect(err)))?;
        Ok(OscClient { socket })
    }

    /// Sends a single message right away.
    pub fn send(&self, address: &str, args: Vec<OscType>) -> Result<()> {
        self.send_packet(&OscPacket::Message(OscMessage {
            addr: address.to_owned(),
            args,
        }))
    }

    /// Sends a message wrapped in a bundle stamped with `time`.
    pub fn send_at(&self, time: SystemTime, address: &str, args: Vec<OscType>) -> Result<()> {
        self.send_packet(&OscPacket::Bundle(OscBundle {
            timetag: osc_time(time),
            content: vec![OscPacket::Message(OscMessage {
                addr: address.to_owned(),
                args,
            })],
        }))
    }

    fn send_packet(&self, packet: &OscPacket) -> Result<()> {
        let bytes = encode(packet).map_err(|err| Error(ErrorInner::OscEncode(err)))?;
        log::debug!("sending {} byte OSC packet", bytes.len());
        self.socket
            .send(&bytes)
            .map_err(|err| Error(ErrorInner::Send(err)))?;
        Ok(())
    }
}

/// Converts a system time to an NTP timestamp.
pub fn osc_time(time: SystemTime) -> OscTime {
    const UNIX_OFFSET: u64 = 2_208_988_800; // From RFC 5905
    const TWO_POW_32: f64 = 4294967296.0;

    // Times before the Unix epoch are clamped to it.
    let unix_time = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    let epoch_time = Duration::new(UNIX_OFFSET, 0) + unix_time;
    let ts_secs = epoch_time.as_secs() as u32;
    let ts_frac = ((epoch_time.subsec_nanos() as f64 * TWO_POW_32) / 1.0e9).round() as u32;
    (ts_secs, ts_frac).into()
}

/// Sends OSC messages to one peer.
pub struct OscHandler {
    name: String,
    env: Weak<Environment>,
    client: OscClient,
    ahead: Mutex<Duration>,
}

impl OscHandler {
    /// Connects a handler named `name` to the peer at `addr`.
    pub fn connect<A: ToSocketAddrs>(
        env: &Arc<Environment>,
        name: impl Into<String>,
        addr: A,
    ) -> Result<OscHandler> {
        Ok(OscHandler {
            name: name.into(),
            env: Arc::downgrade(env),
            client: OscClient::connect(addr)?,
            ahead: Mutex::new(DEFAULT_AHEAD),
        })
    }

    pub fn ahead(&self) -> Duration {
        *self.ahead.lock().unwrap()
    }

    /// Sets how far in the future bundles are stamped.
    pub fn set_ahead(&self, ahead: Duration) {
        *self.ahead.lock().unwrap() = ahead;
    }

    /// Sends `address` with `args` at the cycle's deadline.
    ///
    /// Each argument is resolved with the cycle iteration. A rest in any argument drops the
    /// whole message.
    pub fn send(
        &self,
        cycle: &Cycle,
        address: &str,
        args: Vec<Param>,
    ) -> std::result::Result<(), ParseError> {
        let picker = Picker::new(
            cycle.env(),
            None,
            &Param::from(1.0),
            &Param::from(1.0),
            cycle.iteration(),
        )?;
        let mut resolved = Vec::with_capacity(args.len());
        for arg in &args {
            match picker.pick_value(arg)? {
                Some(value) => resolved.push(value.to_osc()),
                None => {
                    log::debug!("{}: rest in arguments of {}", self.name, address);
                    return Ok(());
                }
            }
        }
        cycle.push(Event::Osc {
            target: self.name.clone(),
            address: address.to_owned(),
            args: resolved,
        });
        Ok(())
    }

    /// Dispatches a message for this handler right away.
    pub fn send_now(&self, address: &str, args: Vec<OscType>) {
        if let Some(env) = self.env.upgrade() {
            env.dispatch(&Event::Osc {
                target: self.name.clone(),
                address: address.to_owned(),
                args,
            });
        }
    }
}

impl Handler for OscHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&self) -> EventKinds {
        EventKinds::new().with(EventKind::Osc)
    }

    fn hook(&self, event: &Event) -> std::result::Result<(), handler::Error> {
        if let Event::Osc {
            target,
            address,
            args,
        } = event
        {
            if *target == self.name {
                let time = SystemTime::now() + self.ahead();
                self.client.send_at(time, address, args.clone())?;
            }
        }
        Ok(())
    }
}

/// A sound to play on SuperDirt.
///
/// Every field is a literal or an expression. The sound `~` or `.` is a rest.
#[derive(Debug, Clone)]
pub struct Sound {
    sound: Param,
    orbit: Param,
    params: Vec<(String, Param)>,
    iterator: Option<Param>,
    divisor: Param,
    rate: Param,
}

impl Sound {
    pub fn new(sound: impl Into<Param>) -> Sound {
        Sound {
            sound: sound.into(),
            orbit: Param::from(0),
            params: Vec::new(),
            iterator: None,
            divisor: Param::from(1),
            rate: Param::from(1),
        }
    }

    pub fn orbit(mut self, orbit: impl Into<Param>) -> Sound {
        self.orbit = orbit.into();
        self
    }

    /// Adds a parameter. Short names such as `lpf` are translated to their SuperDirt name.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Param>) -> Sound {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Picks elements with `iterator` instead of the cycle iteration.
    pub fn iterator(mut self, iterator: impl Into<Param>) -> Sound {
        self.iterator = Some(iterator.into());
        self
    }

    pub fn divisor(mut self, divisor: impl Into<Param>) -> Sound {
        self.divisor = divisor.into();
        self
    }

    pub fn rate(mut self, rate: impl Into<Param>) -> Sound {
        self.rate = rate.into();
        self
    }
}

/// Plays sounds on SuperDirt.
pub struct SuperDirtHandler {
    osc: OscHandler,
}

impl SuperDirtHandler {
    /// Connects to SuperDirt at `addr`, usually [`SUPERDIRT_ADDR`].
    pub fn connect<A: ToSocketAddrs>(env: &Arc<Environment>, addr: A) -> Result<SuperDirtHandler> {
        Ok(SuperDirtHandler {
            osc: OscHandler::connect(env, "superdirt", addr)?,
        })
    }

    pub fn ahead(&self) -> Duration {
        self.osc.ahead()
    }

    /// Sets how far in the future bundles are stamped. SuperDirt calls this the nudge.
    pub fn set_ahead(&self, ahead: Duration) {
        self.osc.set_ahead(ahead);
    }

    /// Plays `sound` at the cycle's deadline.
    pub fn send(&self, cycle: &Cycle, sound: Sound) -> std::result::Result<(), ParseError> {
        let env = cycle.env();
        let picker = Picker::new(
            env,
            sound.iterator.as_ref(),
            &sound.divisor,
            &sound.rate,
            cycle.iteration(),
        )?;

        let name = match picker.pick_value(&sound.sound)? {
            Some(name) => name,
            None => return Ok(()),
        };

        let mut pairs = BTreeMap::new();
        for (key, param) in &sound.params {
            if let Some(value) = picker.pick_value(param)? {
                pairs.insert(alias(key).to_owned(), value.to_osc());
            }
        }

        let state = env.clock_state();
        let orbit = picker.pick(&sound.orbit)?.unwrap_or(0.0);
        let cps = state.tempo().bpm() / 60.0 / state.beats_per_bar() as f64;
        pairs.insert("sound".to_owned(), name.to_osc());
        pairs.insert("orbit".to_owned(), OscType::Int(orbit.round() as i32));
        pairs.insert("cps".to_owned(), OscType::Float(cps as f32));
        pairs.insert("cycle".to_owned(), OscType::Float(state.beat() as f32));

        let args = pairs
            .into_iter()
            .flat_map(|(key, value)| vec![OscType::String(key), value])
            .collect();
        cycle.push(Event::DirtPlay(args));
        Ok(())
    }

    /// Asks SuperDirt to silence everything, along with every other handler.
    pub fn panic(&self) {
        if let Some(env) = self.osc.env.upgrade() {
            env.dispatch(&Event::Panic);
        }
    }
}

impl Handler for SuperDirtHandler {
    fn name(&self) -> &str {
        &self.osc.name
    }

    fn setup(&self) -> EventKinds {
        EventKinds::new()
            .with(EventKind::DirtPlay)
            .with(EventKind::Panic)
    }

    fn hook(&self, event: &Event) -> std::result::Result<(), handler::Error> {
        let time = SystemTime::now() + self.ahead();
        match event {
            Event::DirtPlay(args) => self.osc.client.send_at(time, DIRT_PLAY, args.clone())?,
            Event::Panic => self.osc.client.send_at(
                time,
                DIRT_PLAY,
                vec![
                    OscType::String("sound".to_owned()),
                    OscType::String("superpanic".to_owned()),
                ],
            )?,
            _ => {}
        }
        Ok(())
    }
}
