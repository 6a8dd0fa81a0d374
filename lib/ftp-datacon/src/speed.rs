/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ftp-datacon authors
 */

use std::sync::{Mutex, OnceLock};
use std::time::Instant;

/// Size of one measurement step in milliseconds.
const SPEED_STEP_MS: u64 = 1000;
/// Number of closed steps kept in the ring. More steps give smoother speed
/// changes when the oldest step drops out of the window.
const SPEED_STEP_COUNT: usize = 60;

fn tick_base() -> Instant {
    static BASE: OnceLock<Instant> = OnceLock::new();
    *BASE.get_or_init(Instant::now)
}

/// Monotonic milliseconds since the first use within this process.
pub fn tick_ms() -> u64 {
    tick_base().elapsed().as_millis() as u64
}

#[derive(Default)]
struct MeterState {
    /// ring of per-step byte counts, plus one working step that accumulates
    /// the current interval
    steps: Vec<u64>,
    act_index: usize,
    /// upper time bound of the working step; bytes up to this tick are
    /// accounted to `steps[act_index]`
    act_time_limit: u64,
    /// closed steps plus the working one
    used_steps: usize,
    last_transfer: u64,
}

/// Rolling bytes-per-second measurement over a fixed window of one-second
/// steps. One meter serves a single connection; an `Arc`-shared instance can
/// aggregate a whole group of connections.
pub struct TransferSpeedMeter {
    state: Mutex<MeterState>,
}

impl Default for TransferSpeedMeter {
    fn default() -> Self {
        TransferSpeedMeter::new()
    }
}

impl TransferSpeedMeter {
    pub fn new() -> Self {
        let meter = TransferSpeedMeter {
            state: Mutex::new(MeterState {
                steps: vec![0; SPEED_STEP_COUNT + 1],
                ..Default::default()
            }),
        };
        meter.clear();
        meter
    }

    /// Reset the meter for the next use.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.act_index = 0;
        state.act_time_limit = 0;
        state.used_steps = 0;
        state.last_transfer = tick_ms();
    }

    /// Open the measurement window. Called at the moment the connection is
    /// established, so that idle time before the transfer does not dilute
    /// the reported speed.
    pub fn just_connected(&self) {
        let mut state = self.state.lock().unwrap();
        state.steps[0] = 0;
        state.act_index = 0;
        state.act_time_limit = tick_ms() + SPEED_STEP_MS;
        state.used_steps = 1;
    }

    /// Account transferred bytes at time `now` (a [`tick_ms`] value).
    pub fn add_bytes(&self, count: u64, now: u64) {
        let mut state = self.state.lock().unwrap();
        if count > 0 {
            state.last_transfer = now;
        }
        if now < state.act_time_limit {
            // still inside the working step
            let i = state.act_index;
            state.steps[i] += count;
        } else {
            // close the working step, zero the skipped empty steps and open
            // a new one
            let empty_steps = ((now - state.act_time_limit) / SPEED_STEP_MS) as usize;
            let zeroed = empty_steps.min(SPEED_STEP_COUNT);
            if zeroed > 0 && state.used_steps <= SPEED_STEP_COUNT {
                state.used_steps = (state.used_steps + zeroed).min(SPEED_STEP_COUNT + 1);
            }
            for _ in 0..zeroed {
                state.act_index = (state.act_index + 1) % (SPEED_STEP_COUNT + 1);
                let i = state.act_index;
                state.steps[i] = 0;
            }
            state.act_time_limit += (empty_steps as u64 + 1) * SPEED_STEP_MS;
            state.act_index = (state.act_index + 1) % (SPEED_STEP_COUNT + 1);
            if state.used_steps <= SPEED_STEP_COUNT {
                state.used_steps += 1;
            }
            let i = state.act_index;
            state.steps[i] = count;
        }
    }

    /// Current speed in bytes per second over the measurement window.
    pub fn speed(&self) -> u64 {
        self.speed_at(tick_ms())
    }

    pub(crate) fn speed_at(&self, now: u64) -> u64 {
        let state = self.state.lock().unwrap();
        if state.used_steps == 0 {
            // nothing measured yet
            return 0;
        }

        let mut act_index_added = 0usize;
        let mut empty_steps = 0usize;
        let mut total: u64 = 0;
        let mut add_from_ring = state.used_steps - 1;
        let rest_time;
        if now >= state.act_time_limit {
            // the working step is already closed, maybe some empty steps too
            empty_steps = (((now - state.act_time_limit) / SPEED_STEP_MS) as usize)
                .min(SPEED_STEP_COUNT);
            rest_time = (now - state.act_time_limit) % SPEED_STEP_MS;
            if empty_steps < SPEED_STEP_COUNT {
                total = state.steps[state.act_index];
                act_index_added = 1;
            }
            add_from_ring = (SPEED_STEP_COUNT - act_index_added - empty_steps)
                .min(state.used_steps - 1);
        } else {
            rest_time = now + SPEED_STEP_MS - state.act_time_limit;
            total = state.steps[state.act_index];
        }

        let mut index = state.act_index;
        for _ in 0..add_from_ring {
            index = index.checked_sub(1).unwrap_or(SPEED_STEP_COUNT);
            total += state.steps[index];
        }
        let window_ms =
            (add_from_ring + act_index_added + empty_steps) as u64 * SPEED_STEP_MS + rest_time;
        if window_ms > 0 {
            total * 1000 / window_ms
        } else {
            0
        }
    }

    /// Seconds since the last non-empty transfer.
    pub fn idle_secs(&self) -> u64 {
        let state = self.state.lock().unwrap();
        (tick_ms().saturating_sub(state.last_transfer)) / 1000
    }
}

/// Mutex-guarded "most recent activity" tick shared by a group of data
/// connections, letting their owner track the latest activity across all of
/// them with a single value.
#[derive(Default)]
pub struct SharedTick {
    value: Mutex<u64>,
}

impl SharedTick {
    pub fn set(&self, value: u64) {
        *self.value.lock().unwrap() = value;
    }

    pub fn get(&self) -> u64 {
        *self.value.lock().unwrap()
    }
}
