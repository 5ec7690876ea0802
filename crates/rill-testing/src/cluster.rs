//! Shared cluster state: topology, stream storage, fault hooks.

use std::collections::HashMap;

use parking_lot::Mutex;
use rill_client_api::MAX_BATCH_POINTS;
use rill_client_api::MashDescription;
use rill_client_api::MashMember;
use rill_client_api::NodeRequest;
use rill_client_api::RawPoint;
use rill_client_api::ReplyBody;
use rill_client_api::StatPoint;
use rill_client_api::Status;
use uuid::Uuid;

use crate::store::StreamStore;

/// Size of the placement space, one past the largest placement key.
const PLACEMENT_SPACE: u64 = 1 << 32;

/// A fault injected into the next streaming query for a stream. One-shot:
/// the fault is consumed by the query it fires on.
#[derive(Debug, Clone, Copy)]
pub enum StreamFault {
    /// Deliver `batches` batches, then a terminal error with `code`.
    ErrorAfter {
        /// Batches delivered before the failure.
        batches: usize,
        /// Status code of the injected terminal error.
        code: u16,
    },
    /// Deliver batches normally, then stall indefinitely before batch index
    /// `batches` (or before the terminal frame, if past the last batch).
    StallAfter {
        /// Batches delivered before the stall.
        batches: usize,
    },
}

struct MemberSlot {
    hash: u32,
    address: String,
    up: bool,
    misroute: bool,
    start: u64,
    end: u64,
}

struct ClusterState {
    revision: u64,
    members: Vec<MemberSlot>,
    streams: HashMap<Uuid, StreamStore>,
    faults: HashMap<Uuid, StreamFault>,
}

/// What a node writes back for one request.
pub(crate) enum HandlerOutput {
    Unary(ReplyBody),
    Stream {
        batches: Vec<ReplyBody>,
        fin: ReplyBody,
        stall_before: Option<usize>,
    },
}

/// The state shared by every node of a test cluster.
pub(crate) struct ClusterCore {
    state: Mutex<ClusterState>,
}

impl ClusterCore {
    /// Build a core with `addresses.len()` members splitting the placement
    /// space evenly, hashes assigned in order starting at 1.
    pub(crate) fn new(addresses: Vec<String>) -> Self {
        let count = addresses.len() as u64;
        let members = addresses
            .into_iter()
            .enumerate()
            .map(|(index, address)| {
                let index = index as u64;
                MemberSlot {
                    hash: index as u32 + 1,
                    address,
                    up: true,
                    misroute: false,
                    start: index * PLACEMENT_SPACE / count,
                    end: (index + 1) * PLACEMENT_SPACE / count,
                }
            })
            .collect();
        Self {
            state: Mutex::new(ClusterState {
                revision: 1,
                members,
                streams: HashMap::new(),
                faults: HashMap::new(),
            }),
        }
    }

    /// Current routing snapshot, as any node would report it.
    pub(crate) fn mash_description(&self) -> MashDescription {
        let state = self.state.lock();
        MashDescription {
            revision: state.revision,
            members: state
                .members
                .iter()
                .map(|member| MashMember {
                    hash: member.hash,
                    start: member.start,
                    end: member.end,
                    up: member.up,
                    addresses: vec![member.address.clone()],
                })
                .collect(),
        }
    }

    /// Rotate every member's owned slice to the next member and bump the
    /// snapshot revision. Streams change owners; clients holding the old
    /// snapshot start seeing wrong-endpoint answers.
    pub(crate) fn rotate_ownership(&self) {
        let mut state = self.state.lock();
        let count = state.members.len();
        let slices: Vec<(u64, u64)> =
            state.members.iter().map(|member| (member.start, member.end)).collect();
        for (index, member) in state.members.iter_mut().enumerate() {
            let (start, end) = slices[(index + 1) % count];
            member.start = start;
            member.end = end;
        }
        state.revision += 1;
    }

    /// Mark a member up or down and bump the snapshot revision. A down
    /// member leaves its slice of the placement space unmapped.
    pub(crate) fn set_member_up(&self, index: usize, up: bool) {
        let mut state = self.state.lock();
        state.members[index].up = up;
        state.revision += 1;
    }

    /// Make a node answer wrong-endpoint to every stream operation,
    /// regardless of ownership. The snapshot is left untouched, so a
    /// refresh does not cure the condition.
    pub(crate) fn set_misroute(&self, index: usize, on: bool) {
        self.state.lock().members[index].misroute = on;
    }

    /// Arm a one-shot fault on the next streaming query for `stream`.
    pub(crate) fn set_stream_fault(&self, stream: Uuid, fault: StreamFault) {
        self.state.lock().faults.insert(stream, fault);
    }

    fn owner_of(state: &ClusterState, stream: &Uuid) -> Option<u32> {
        let bytes = stream.as_bytes();
        let key = u64::from(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
        state
            .members
            .iter()
            .find(|member| member.up && member.start <= key && key < member.end)
            .map(|member| member.hash)
    }

    fn check_owner(state: &ClusterState, my_hash: u32, stream: &Uuid) -> Result<(), Status> {
        let me = state
            .members
            .iter()
            .find(|member| member.hash == my_hash)
            .ok_or_else(|| Status::unreachable("node not in cluster"))?;
        if me.misroute {
            return Err(Status::wrong_endpoint(format!("stream {stream} is not owned here")));
        }
        match Self::owner_of(state, stream) {
            Some(owner) if owner == my_hash => Ok(()),
            Some(_) => Err(Status::wrong_endpoint(format!("stream {stream} is not owned here"))),
            None => Err(Status::cluster_degraded()),
        }
    }

    /// Handle one request as node `my_hash`.
    pub(crate) fn handle(&self, my_hash: u32, request: NodeRequest) -> HandlerOutput {
        let mut state = self.state.lock();
        match request {
            NodeRequest::Info => {
                drop(state);
                HandlerOutput::Unary(ReplyBody::Info { mash: self.mash_description() })
            }
            NodeRequest::Create { stream, collection, tags, annotation } => {
                HandlerOutput::Unary(Self::unary(Self::check_owner(&state, my_hash, &stream).and_then(
                    |()| {
                        if state.streams.contains_key(&stream) {
                            return Err(Status::invalid_arguments("stream already exists"));
                        }
                        state.streams.insert(stream, StreamStore::new(collection, tags, annotation));
                        Ok(ReplyBody::Ack)
                    },
                )))
            }
            NodeRequest::Insert { stream, points } => {
                HandlerOutput::Unary(Self::unary(Self::check_owner(&state, my_hash, &stream).and_then(
                    |()| {
                        let store = Self::store_mut(&mut state, &stream)?;
                        store.insert(&points)?;
                        Ok(ReplyBody::Ack)
                    },
                )))
            }
            NodeRequest::InsertValues { stream, times, values } => {
                HandlerOutput::Unary(Self::unary(Self::check_owner(&state, my_hash, &stream).and_then(
                    |()| {
                        if times.len() != values.len() {
                            return Err(Status::invalid_arguments(
                                "times and values must have equal length",
                            ));
                        }
                        let points: Vec<RawPoint> = times
                            .iter()
                            .zip(&values)
                            .map(|(time, value)| RawPoint { time: *time, value: *value })
                            .collect();
                        let store = Self::store_mut(&mut state, &stream)?;
                        store.insert(&points)?;
                        Ok(ReplyBody::Ack)
                    },
                )))
            }
            NodeRequest::DeleteRange { stream, start, end } => {
                HandlerOutput::Unary(Self::unary(Self::check_owner(&state, my_hash, &stream).and_then(
                    |()| {
                        let store = Self::store_mut(&mut state, &stream)?;
                        store.delete_range(start, end)?;
                        Ok(ReplyBody::Ack)
                    },
                )))
            }
            NodeRequest::Flush { stream } => {
                HandlerOutput::Unary(Self::unary(Self::check_owner(&state, my_hash, &stream).and_then(
                    |()| {
                        let store = Self::store(&state, &stream)?;
                        Ok(ReplyBody::Version { version: store.version() })
                    },
                )))
            }
            NodeRequest::Nearest { stream, time, version: _, backward } => {
                HandlerOutput::Unary(Self::unary(Self::check_owner(&state, my_hash, &stream).and_then(
                    |()| {
                        let store = Self::store(&state, &stream)?;
                        let point = store.nearest(time, backward)?;
                        Ok(ReplyBody::Point { point, version: store.version() })
                    },
                )))
            }
            NodeRequest::RawValues { stream, start, end, version: _ } => {
                let result = Self::check_owner(&state, my_hash, &stream).and_then(|()| {
                    let store = Self::store(&state, &stream)?;
                    Ok((store.raw_values(start, end)?, store.version()))
                });
                Self::stream_output(&mut state, stream, result, raw_batches)
            }
            NodeRequest::Windows { stream, start, end, width, depth: _, version: _ } => {
                let result = Self::check_owner(&state, my_hash, &stream).and_then(|()| {
                    let store = Self::store(&state, &stream)?;
                    Ok((store.windows(start, end, width)?, store.version()))
                });
                Self::stream_output(&mut state, stream, result, stat_batches)
            }
            NodeRequest::AlignedWindows { stream, start, end, pointwidth, version: _ } => {
                let result = Self::check_owner(&state, my_hash, &stream).and_then(|()| {
                    let store = Self::store(&state, &stream)?;
                    Ok((store.aligned_windows(start, end, pointwidth)?, store.version()))
                });
                Self::stream_output(&mut state, stream, result, stat_batches)
            }
        }
    }

    fn unary(result: Result<ReplyBody, Status>) -> ReplyBody {
        match result {
            Ok(body) => body,
            Err(status) => ReplyBody::Error { status },
        }
    }

    fn store<'a>(state: &'a ClusterState, stream: &Uuid) -> Result<&'a StreamStore, Status> {
        state
            .streams
            .get(stream)
            .ok_or_else(|| Status::invalid_arguments(format!("no such stream {stream}")))
    }

    fn store_mut<'a>(
        state: &'a mut ClusterState,
        stream: &Uuid,
    ) -> Result<&'a mut StreamStore, Status> {
        state
            .streams
            .get_mut(stream)
            .ok_or_else(|| Status::invalid_arguments(format!("no such stream {stream}")))
    }

    fn stream_output<T>(
        state: &mut ClusterState,
        stream: Uuid,
        result: Result<(Vec<T>, u64), Status>,
        to_batches: fn(Vec<T>) -> Vec<ReplyBody>,
    ) -> HandlerOutput {
        let (points, version) = match result {
            Ok(ok) => ok,
            Err(status) => {
                return HandlerOutput::Stream {
                    batches: Vec::new(),
                    fin: ReplyBody::Final { version: 0, status: Some(status) },
                    stall_before: None,
                }
            }
        };
        let mut batches = to_batches(points);
        let mut fin = ReplyBody::Final { version, status: None };
        let mut stall_before = None;
        match state.faults.remove(&stream) {
            Some(StreamFault::ErrorAfter { batches: keep, code }) => {
                batches.truncate(keep);
                fin = ReplyBody::Final {
                    version,
                    status: Some(Status::new(code, "injected fault")),
                };
            }
            Some(StreamFault::StallAfter { batches: index }) => {
                stall_before = Some(index);
            }
            None => {}
        }
        HandlerOutput::Stream { batches, fin, stall_before }
    }
}

fn raw_batches(points: Vec<RawPoint>) -> Vec<ReplyBody> {
    points
        .chunks(MAX_BATCH_POINTS)
        .map(|chunk| ReplyBody::RawBatch { points: chunk.to_vec() })
        .collect()
}

fn stat_batches(points: Vec<StatPoint>) -> Vec<ReplyBody> {
    points
        .chunks(MAX_BATCH_POINTS)
        .map(|chunk| ReplyBody::StatBatch { points: chunk.to_vec() })
        .collect()
}
