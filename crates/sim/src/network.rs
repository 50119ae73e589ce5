//! Event queue and lossy broadcast medium.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::Rng;
use tracing::{debug, trace};

use sgc_protocol::{Clock, Coordinator, ManualClock, Member, MsgType, SgcConfig, SgcNode, Timer};
use sgc_types::Timestamp;

/// Index into the node table. The coordinator is always node 0.
pub type NodeIndex = usize;

#[derive(Debug)]
enum Event {
    Timer { node: NodeIndex, timer: Timer },
    Deliver { node: NodeIndex, frame: Arc<[u8]> },
}

#[derive(Debug)]
struct Scheduled {
    at: Timestamp,
    seq: u64,
    event: Event,
}

// Earliest event first; ties resolved in scheduling order
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        (self.at, self.seq) == (other.at, other.seq)
    }
}

impl Eq for Scheduled {}

/// Frame counters.
#[derive(Debug, Default)]
pub struct TrafficStats {
    pub frames_sent: u64,
    pub deliveries: u64,
    pub dropped: u64,
    pub by_type: BTreeMap<String, u64>,
}

/// Delivery parameters of the medium.
#[derive(Clone, Copy, Debug)]
pub struct LinkModel {
    /// Probability that one delivery is lost.
    pub loss: f64,
    pub latency: Duration,
}

pub struct Simulation {
    pub coordinator: Coordinator,
    pub members: Vec<Member>,
    clock: ManualClock,
    config: SgcConfig,
    link: LinkModel,
    queue: BinaryHeap<Scheduled>,
    next_seq: u64,
    rng: StdRng,
    pub stats: TrafficStats,
}

impl Simulation {
    pub fn new(
        coordinator: Coordinator,
        members: Vec<Member>,
        clock: ManualClock,
        config: SgcConfig,
        link: LinkModel,
        rng: StdRng,
    ) -> Self {
        Self {
            coordinator,
            members,
            clock,
            config,
            link,
            queue: BinaryHeap::new(),
            next_seq: 0,
            rng,
            stats: TrafficStats::default(),
        }
    }

    fn node_count(&self) -> usize {
        self.members.len() + 1
    }

    fn node_mut(&mut self, node: NodeIndex) -> &mut dyn SgcNode {
        match node {
            0 => &mut self.coordinator,
            n => &mut self.members[n - 1],
        }
    }

    fn schedule(&mut self, at: Timestamp, event: Event) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Scheduled { at, seq, event });
    }

    /// Arm every node's timers. Members start at a random offset within
    /// their first period so their proposals do not line up.
    pub fn arm_timers(&mut self) {
        let start = self.clock.now();
        for node in 0..self.node_count() {
            let timers = self.node_mut(node).timers();
            for &timer in timers {
                let period = self.config.interval(timer);
                let offset = if node == 0 {
                    Duration::ZERO
                } else {
                    let micros = u64::try_from(period.as_micros()).unwrap_or(u64::MAX);
                    Duration::from_micros(self.rng.gen_range(0..micros.max(1)))
                };
                self.schedule(start + offset, Event::Timer { node, timer });
            }
        }
    }

    /// Process events until the queue is empty or `end` is reached.
    pub fn run_until(&mut self, end: Timestamp) -> Result<()> {
        while let Some(next) = self.queue.peek() {
            if next.at > end {
                break;
            }
            let Some(Scheduled { at, event, .. }) = self.queue.pop() else {
                break;
            };
            self.clock.set(at);

            let (node, frames) = match event {
                Event::Timer { node, timer } => {
                    let frames = self.node_mut(node).on_timer_tick(timer)?;
                    let period = self.config.interval(timer);
                    self.schedule(at + period, Event::Timer { node, timer });
                    (node, frames)
                }
                Event::Deliver { node, frame } => (node, self.node_mut(node).handle_message(&frame)?),
            };

            for frame in frames {
                self.broadcast(node, frame.into(), at);
            }
        }
        self.clock.set(end);
        Ok(())
    }

    fn broadcast(&mut self, from: NodeIndex, frame: Arc<[u8]>, now: Timestamp) {
        let kind = frame_type(&frame);
        trace!(from, kind, len = frame.len(), "Broadcast");

        self.stats.frames_sent += 1;
        *self.stats.by_type.entry(kind.to_string()).or_default() += 1;

        for node in (0..self.node_count()).filter(|n| *n != from) {
            if self.rng.gen_bool(self.link.loss) {
                self.stats.dropped += 1;
                continue;
            }
            self.stats.deliveries += 1;
            self.schedule(
                now + self.link.latency,
                Event::Deliver {
                    node,
                    frame: frame.clone(),
                },
            );
        }
        debug!(from, kind, "Frame scheduled for delivery");
    }
}

fn frame_type(frame: &[u8]) -> &'static str {
    let tag = frame
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes);
    match tag.map(MsgType::try_from) {
        Some(Ok(MsgType::Heartbeat)) => "Heartbeat",
        Some(Ok(MsgType::HeartbeatAck)) => "HeartbeatAck",
        Some(Ok(MsgType::NotifyPosition)) => "NotifyPosition",
        Some(Ok(MsgType::Join)) => "Join",
        Some(Ok(MsgType::JoinAck)) => "JoinAck",
        Some(Ok(MsgType::KeyEncapNotify)) => "KeyEncapNotify",
        Some(Ok(MsgType::KeyEncap)) => "KeyEncap",
        Some(Ok(MsgType::KeyUpdate)) => "KeyUpdate",
        Some(Ok(MsgType::KeyUpdateAck)) => "KeyUpdateAck",
        _ => "Unknown",
    }
}
