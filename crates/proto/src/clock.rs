use crate::{ProtoError, ProtoResult};

/// Rebases an agent-reported event time onto the server clock.
///
/// Agents send their own clock reading with every request. The difference to
/// the server clock is applied to the event time, so a drifting agent clock
/// never distorts stored chronology: `server_now - agent_clock + event_time`.
pub fn correct_event_time(server_now: i64, agent_clock: i64, event_time: i64) -> ProtoResult<i64> {
    server_now
        .checked_sub(agent_clock)
        .and_then(|skew| skew.checked_add(event_time))
        .ok_or(ProtoError::ClockOverflow {
            server_now,
            agent_clock,
            event_time,
        })
}
