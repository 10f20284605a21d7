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

use super::{ClockSource, ClockState, Error, InternalClock, Result, Tempo};
use rosc::{decoder::decode, OscPacket, OscType};
use std::{
    io,
    net::UdpSocket,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

/// The tempo and beat position of an external clock at an instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timeline {
    pub tempo: Tempo,
    pub beat: f64,
    pub at: Instant,
}

impl Timeline {
    /// The peer's beat position at `when`, extrapolated at the peer's tempo.
    pub fn beat_at(&self, when: Instant) -> f64 {
        let beats_per_sec = self.tempo.bpm() / 60.0;
        if when >= self.at {
            self.beat + (when - self.at).as_secs_f64() * beats_per_sec
        } else {
            self.beat - (self.at - when).as_secs_f64() * beats_per_sec
        }
    }

    /// The instant at which the peer reaches `beat`, or `None` if that instant is too far away
    /// to be represented.
    pub fn instant_at_beat(&self, beat: f64) -> Option<Instant> {
        let secs = (beat - self.beat) * 60.0 / self.tempo.bpm();
        let distance = Duration::try_from_secs_f64(secs.abs()).ok()?;
        if secs >= 0.0 {
            self.at.checked_add(distance)
        } else {
            Some(self.at.checked_sub(distance).unwrap_or(self.at))
        }
    }
}

/// An external time-sync peer.
pub trait Peer: Send + 'static {
    /// Returns the most recent timeline heard from the peer, or `None` if nothing new arrived.
    fn timeline(&mut self) -> io::Result<Option<Timeline>>;
}

/// A clock that follows the beat position and tempo of a [`Peer`].
///
/// Until the peer has been heard from, the clock runs free like an [`InternalClock`]. Once a
/// timeline is known, tick boundaries are placed where the peer crosses them, so the phase within
/// the beat matches the peer. The local tick counter is offset from the peer by whole beats and
/// is never rewound: when the peer jumps ahead, the missed ticks are delivered one per iteration
/// without waiting, and when it jumps back by more than a beat the offset is recomputed.
pub struct SyncedClock<P> {
    peer: P,
    timeline: Option<Timeline>,
    offset: Option<f64>,
    fallback: InternalClock,
}

impl<P: Peer> SyncedClock<P> {
    pub fn new(peer: P) -> SyncedClock<P> {
        SyncedClock {
            peer,
            timeline: None,
            offset: None,
            fallback: InternalClock::new(),
        }
    }

    /// Whole beats between the local tick counter and the peer's beat, rounded so that the local
    /// position is at or ahead of the current tick.
    fn anchor(state: &ClockState, timeline: &Timeline, now: Instant) -> f64 {
        let ppqn = f64::from(state.ppqn());
        let peer_tick = (timeline.beat_at(now) * ppqn).floor();
        -(peer_tick - state.tick() as f64).div_euclid(ppqn)
    }

    /// The peer's beat at which the local tick `tick` falls.
    fn peer_beat(state: &ClockState, offset: f64, tick: u64) -> f64 {
        tick as f64 / f64::from(state.ppqn()) - offset
    }

    /// The next boundary placed on the peer's timeline.
    fn follow(&mut self, state: &ClockState, timeline: Timeline, now: Instant) -> Result<Instant> {
        let place = |offset: f64| {
            let beat = Self::peer_beat(state, offset, state.tick() + 1);
            timeline.instant_at_beat(beat).ok_or(Error::Timeline(beat))
        };
        let offset = *self
            .offset
            .get_or_insert_with(|| Self::anchor(state, &timeline, now));
        let mut boundary = place(offset)?;

        if boundary.saturating_duration_since(now) > timeline.tempo.beat_duration() {
            log::warn!("time-sync peer moved backwards, re-anchoring");
            let offset = Self::anchor(state, &timeline, now);
            self.offset = Some(offset);
            boundary = place(offset)?;
        }

        Ok(boundary.max(now))
    }
}

impl<P: Peer> ClockSource for SyncedClock<P> {
    fn name(&self) -> &str {
        "synced"
    }

    fn reset(&mut self, state: &ClockState, now: Instant) {
        self.offset = None;
        self.fallback.reset(state, now);
    }

    fn next_boundary(&mut self, state: &mut ClockState, now: Instant) -> Result<Instant> {
        if let Some(timeline) = self.peer.timeline().map_err(Error::Peer)? {
            if self.timeline.is_none() {
                log::debug!("time-sync peer heard at {} bpm", timeline.tempo.bpm());
            }
            state.set_tempo(timeline.tempo);
            self.timeline = Some(timeline);
        }

        let timeline = match self.timeline {
            Some(timeline) => timeline,
            None => return self.fallback.next_boundary(state, now),
        };

        let boundary = self.follow(state, timeline, now);
        if boundary.is_err() {
            // Forget the timeline so a restarted clock runs free until the peer is heard again.
            self.timeline = None;
            self.offset = None;
            self.fallback.reset(state, now);
        }
        boundary
    }
}


/// A [`Peer`] that listens for `/shoal/timeline <tempo> <beat>` OSC messages over UDP.
///
/// The beat is taken to be the peer's position at the instant the message was received. Both
/// arguments may be sent as floats, doubles or integers.
pub struct OscPeer {
    latest: Arc<Mutex<Option<Timeline>>>,
    failure: Arc<Mutex<Option<io::Error>>>,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

/// The OSC address [`OscPeer`] listens for.
pub const TIMELINE_ADDR: &str = "/shoal/timeline";

impl OscPeer {
    /// Bind a UDP socket and start listening for timelines.
    pub fn bind(addr: &str) -> io::Result<OscPeer> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;

        let latest = Arc::new(Mutex::new(None));
        let failure = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let latest = Arc::clone(&latest);
            let failure = Arc::clone(&failure);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("shoal-sync".to_owned())
                .spawn(move || recv_loop(socket, latest, failure, stop))?
        };

        Ok(OscPeer {
            latest,
            failure,
            stop,
            thread: Some(thread),
        })
    }
}

impl Peer for OscPeer {
    fn timeline(&mut self) -> io::Result<Option<Timeline>> {
        if let Some(err) = self.failure.lock().unwrap().take() {
            return Err(err);
        }
        Ok(self.latest.lock().unwrap().take())
    }
}

impl Drop for OscPeer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn recv_loop(
    socket: UdpSocket,
    latest: Arc<Mutex<Option<Timeline>>>,
    failure: Arc<Mutex<Option<io::Error>>>,
    stop: Arc<AtomicBool>,
) {
    const MTU: usize = 65536;
    let mut buffer = [0_u8; MTU];
    while !stop.load(Ordering::SeqCst) {
        let len = match socket.recv(&mut buffer) {
            Ok(len) => len,
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(err) => {
                *failure.lock().unwrap() = Some(err);
                return;
            }
        };
        let at = Instant::now();
        match decode(&buffer[..len]) {
            Ok(packet) => {
                if let Some(timeline) = parse_timeline(packet, at) {
                    *latest.lock().unwrap() = Some(timeline);
                }
            }
            Err(err) => log::error!("decoding time-sync packet: {:?}", err),
        }
    }
}

fn parse_timeline(packet: OscPacket, at: Instant) -> Option<Timeline> {
    match packet {
        OscPacket::Message(message) if message.addr == TIMELINE_ADDR => {
            let number = |arg: &OscType| match *arg {
                OscType::Float(value) => Some(f64::from(value)),
                OscType::Double(value) => Some(value),
                OscType::Int(value) => Some(f64::from(value)),
                _ => None,
            };
            let (tempo, beat) = match message.args.as_slice() {
                [tempo, beat] => (number(tempo)?, number(beat)?),
                _ => {
                    log::error!("malformed time-sync message: {:?}", message.args);
                    return None;
                }
            };
            if !beat.is_finite() {
                log::error!("ignoring time-sync message: beat {} is not finite", beat);
                return None;
            }
            match Tempo::from_bpm(tempo) {
                Ok(tempo) => Some(Timeline { tempo, beat, at }),
                Err(err) => {
                    log::error!("ignoring time-sync message: {}", err);
                    None
                }
            }
        }
        OscPacket::Message(_) => None,
        OscPacket::Bundle(bundle) => bundle
            .content
            .into_iter()
            .filter_map(|packet| parse_timeline(packet, at))
            .last(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rosc::OscMessage;
    use std::collections::VecDeque;

    struct ScriptedPeer(VecDeque<io::Result<Option<Timeline>>>);

    impl Peer for ScriptedPeer {
        fn timeline(&mut self) -> io::Result<Option<Timeline>> {
            self.0.pop_front().unwrap_or(Ok(None))
        }
    }

    fn state() -> ClockState {
        ClockState::new(Tempo::from_bpm(120.0).unwrap(), 4, 4).unwrap()
    }

    #[test]
    fn follows_peer_tempo_and_phase() {
        let now = Instant::now();
        let timeline = Timeline {
            tempo: Tempo::from_bpm(60.0).unwrap(),
            beat: 10.25,
            at: now,
        };
        let mut clock = SyncedClock::new(ScriptedPeer(vec![Ok(Some(timeline))].into()));
        let mut state = state();
        clock.reset(&state, now);

        // Locking on delivers the tick for the peer's current quarter beat right away.
        assert_eq!(now, clock.next_boundary(&mut state, now).unwrap());
        assert_eq!(60.0, state.tempo().bpm());

        // The next quarter beat of the peer is 10.5, a quarter of a second away.
        state.advance(now);
        assert_eq!(
            now + Duration::from_millis(250),
            clock.next_boundary(&mut state, now).unwrap()
        );
    }

    #[test]
    fn catches_up_without_waiting_when_peer_jumps_ahead() {
        let now = Instant::now();
        let tempo = Tempo::from_bpm(60.0).unwrap();
        let mut clock = SyncedClock::new(ScriptedPeer(
            vec![
                Ok(Some(Timeline {
                    tempo,
                    beat: 0.0,
                    at: now,
                })),
                Ok(Some(Timeline {
                    tempo,
                    beat: 2.0,
                    at: now,
                })),
            ]
            .into(),
        ));
        let mut state = state();
        clock.reset(&state, now);

        assert_eq!(
            now + Duration::from_millis(250),
            clock.next_boundary(&mut state, now).unwrap()
        );
        assert_eq!(now, clock.next_boundary(&mut state, now).unwrap());
    }

    #[test]
    fn runs_free_until_peer_is_heard() {
        let now = Instant::now();
        let mut clock = SyncedClock::new(ScriptedPeer(VecDeque::new()));
        let mut state = state();
        clock.reset(&state, now);
        assert_eq!(
            now + Duration::from_millis(125),
            clock.next_boundary(&mut state, now).unwrap()
        );
    }

    #[test]
    fn peer_failure_is_reported() {
        let now = Instant::now();
        let mut clock = SyncedClock::new(ScriptedPeer(
            vec![Err(io::Error::new(io::ErrorKind::Other, "gone"))].into(),
        ));
        let mut state = state();
        assert!(matches!(
            clock.next_boundary(&mut state, now),
            Err(Error::Peer(_))
        ));
    }

    #[test]
    fn parses_timeline_messages() {
        let at = Instant::now();
        let packet = OscPacket::Message(OscMessage {
            addr: TIMELINE_ADDR.to_owned(),
            args: vec![OscType::Double(98.5), OscType::Float(3.0)],
        });
        let timeline = parse_timeline(packet, at).unwrap();
        assert_eq!(98.5, timeline.tempo.bpm());
        assert_eq!(3.0, timeline.beat);

        let bad = OscPacket::Message(OscMessage {
            addr: TIMELINE_ADDR.to_owned(),
            args: vec![OscType::Float(0.0), OscType::Float(3.0)],
        });
        assert_eq!(None, parse_timeline(bad, at));

        let nan = OscPacket::Message(OscMessage {
            addr: TIMELINE_ADDR.to_owned(),
            args: vec![OscType::Float(120.0), OscType::Double(f64::NAN)],
        });
        assert_eq!(None, parse_timeline(nan, at));
    }

    #[test]
    fn unplaceable_peer_position_is_an_error() {
        let now = Instant::now();
        let tempo = Tempo::from_bpm(60.0).unwrap();
        let mut clock = SyncedClock::new(ScriptedPeer(
            vec![
                Ok(Some(Timeline {
                    tempo,
                    beat: 0.0,
                    at: now,
                })),
                Ok(Some(Timeline {
                    tempo,
                    beat: f64::NAN,
                    at: now,
                })),
            ]
            .into(),
        ));
        let mut state = state();
        clock.reset(&state, now);

        assert!(clock.next_boundary(&mut state, now).is_ok());
        assert!(matches!(
            clock.next_boundary(&mut state, now),
            Err(Error::Timeline(_))
        ));

        // The bad timeline is forgotten and the clock runs free at the last good tempo.
        assert_eq!(
            now + Duration::from_millis(250),
            clock.next_boundary(&mut state, now).unwrap()
        );
    }
}
