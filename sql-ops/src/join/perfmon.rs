// Copyright 2019-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde_derive::Serialize;
use std::ops::AddAssign;
use std::time::Duration;

/// Performance counters of a join session or an execution node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Perfmon {
    pub num_sessions: u64,
    pub num_retries: u64,
    pub num_kern_exec: u64,
    pub num_kern_proj: u64,
    pub num_dma_send: u64,
    pub num_dma_recv: u64,
    pub bytes_dma_send: u64,
    pub bytes_dma_recv: u64,
    pub time_inner_load: Duration,
    pub time_outer_load: Duration,
    pub time_materialize: Duration,
    pub time_dma_send: Duration,
    pub time_kern_exec: Duration,
    pub time_kern_proj: Duration,
    pub time_dma_recv: Duration,
}

impl AddAssign for Perfmon {
    fn add_assign(&mut self, other: Self) {
        self.num_sessions += other.num_sessions;
        self.num_retries += other.num_retries;
        self.num_kern_exec += other.num_kern_exec;
        self.num_kern_proj += other.num_kern_proj;
        self.num_dma_send += other.num_dma_send;
        self.num_dma_recv += other.num_dma_recv;
        self.bytes_dma_send += other.bytes_dma_send;
        self.bytes_dma_recv += other.bytes_dma_recv;
        self.time_inner_load += other.time_inner_load;
        self.time_outer_load += other.time_outer_load;
        self.time_materialize += other.time_materialize;
        self.time_dma_send += other.time_dma_send;
        self.time_kern_exec += other.time_kern_exec;
        self.time_kern_proj += other.time_kern_proj;
        self.time_dma_recv += other.time_dma_recv;
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn bandwidth(bytes: u64, d: Duration) -> f64 {
    if d.as_nanos() == 0 {
        0.0
    } else {
        bytes as f64 / d.as_secs_f64() / (1024.0 * 1024.0)
    }
}

impl Perfmon {
    /// Renders the counters as explain lines of the form `label: value`.
    pub fn explain_lines(&self) -> Vec<(String, String)> {
        let mut lines = vec![
            (
                "Total time to load".to_string(),
                format!(
                    "inner {:.2} ms, outer {:.2} ms",
                    millis(self.time_inner_load),
                    millis(self.time_outer_load)
                ),
            ),
            (
                "Total time to materialize".to_string(),
                format!("{:.2} ms", millis(self.time_materialize)),
            ),
            (
                "Sessions".to_string(),
                format!("{} (retried: {})", self.num_sessions, self.num_retries),
            ),
            (
                "DMA send".to_string(),
                format!(
                    "{:.2} ms, {} transfers, {} bytes, {:.2} MB/s",
                    millis(self.time_dma_send),
                    self.num_dma_send,
                    self.bytes_dma_send,
                    bandwidth(self.bytes_dma_send, self.time_dma_send)
                ),
            ),
        ];

        if self.num_kern_exec > 0 {
            lines.push((
                "Kernel exec (main)".to_string(),
                format!(
                    "total {:.2} ms, avg {:.3} ms, count {}",
                    millis(self.time_kern_exec),
                    millis(self.time_kern_exec) / self.num_kern_exec as f64,
                    self.num_kern_exec
                ),
            ));
        }
        if self.num_kern_proj > 0 {
            lines.push((
                "Kernel exec (proj)".to_string(),
                format!(
                    "total {:.2} ms, avg {:.3} ms, count {}",
                    millis(self.time_kern_proj),
                    millis(self.time_kern_proj) / self.num_kern_proj as f64,
                    self.num_kern_proj
                ),
            ));
        }

        lines.push((
            "DMA recv".to_string(),
            format!(
                "{:.2} ms, {} transfers, {} bytes, {:.2} MB/s",
                millis(self.time_dma_recv),
                self.num_dma_recv,
                self.bytes_dma_recv,
                bandwidth(self.bytes_dma_recv, self.time_dma_recv)
            ),
        ));

        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let mut total = Perfmon::default();
        let session = Perfmon {
            num_sessions: 1,
            num_kern_exec: 1,
            bytes_dma_send: 512,
            time_kern_exec: Duration::from_millis(3),
            ..Perfmon::default()
        };
        total += session;
        total += session;

        assert_eq!(total.num_sessions, 2);
        assert_eq!(total.bytes_dma_send, 1024);
        assert_eq!(total.time_kern_exec, Duration::from_millis(6));
        assert!(total
            .explain_lines()
            .iter()
            .any(|(label, _)| label == "Kernel exec (main)"));
    }
}
