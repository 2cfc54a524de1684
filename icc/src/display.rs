// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Text dumps of the topology state and of the bandwidth history.

use crate::history::{EntityKey, Record};
use crate::topology::Topology;
use std::fmt::Display;

struct Heading(String);
const LINE_WIDTH: usize = 81;
impl Display for Heading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = (LINE_WIDTH - (self.0.len() + 2)) / 2;
        write!(f, " {0:─<width$}", "─", width = len)?;
        write!(f, " {} ", self.0)?;
        writeln!(f, " {0:─<width$}", "─", width = len)
    }
}

fn field_names(key: EntityKey) -> &'static [&'static str] {
    match key {
        EntityKey::CommonPort(_) => &["avg", "peak", "mix"],
        EntityKey::Channel(_) => &["srt_r", "srt_w", "hrt_r", "hrt_w", "max"],
        EntityKey::LarbPort(_) => &["avg", "peak", "ostdl"],
        EntityKey::HrtTotal => &["disp", "cam", "total"],
    }
}

fn fmt_record(f: &mut std::fmt::Formatter<'_>, record: &Record) -> std::fmt::Result {
    write!(
        f,
        "    {:>6}.{:03}",
        record.at.as_secs(),
        record.at.subsec_millis()
    )?;
    for value in &record.fields {
        write!(f, " {value:>10}")?;
    }
    writeln!(f)
}

/// Bandwidth history of every entity that recorded one.
pub struct HistoryDump<'a>(pub &'a Topology);

impl Display for HistoryDump<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let recorder = self.0.history();
        let keys = recorder.keys();
        Heading(format!("Bandwidth history ({})", keys.len())).fmt(f)?;
        for key in keys {
            let name = match key {
                EntityKey::CommonPort(id) | EntityKey::LarbPort(id) => {
                    self.0.name(id).unwrap_or_default().to_string()
                }
                EntityKey::Channel(_) | EntityKey::HrtTotal => key.to_string(),
            };
            write!(f, "  {name}\n    {:>10}", "time")?;
            for field in field_names(key) {
                write!(f, " {field:>10}")?;
            }
            writeln!(f)?;
            for record in recorder.dump(key) {
                fmt_record(f, &record)?;
            }
        }
        Ok(())
    }
}

/// The most recent larb event.
pub struct LastLarbDump<'a>(pub &'a Topology);

impl Display for LastLarbDump<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Heading("Last larb update".to_string()).fmt(f)?;
        let Some(event) = self.0.history().last_larb() else {
            return writeln!(f, "  (none)");
        };
        let name = |id| self.0.name(id).unwrap_or_default();
        writeln!(
            f,
            "  {:>6}.{:03} {} ({}) / {} ({}): avg {} peak {} ostdl {:#x}",
            event.at.as_secs(),
            event.at.subsec_millis(),
            name(event.larb),
            event.larb,
            name(event.port),
            event.port,
            event.avg,
            event.peak,
            event.ostdl
        )
    }
}

impl Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Heading(format!("Interconnect ({} segment(s))", self.buses.len())).fmt(f)?;
        for index in self.segments() {
            let Some(bus) = self.bus(index) else {
                continue;
            };
            writeln!(
                f,
                "  {} {} MHz {} uV avg {} peak {} hrt {}/{} channel max {} step {:?}",
                bus.name,
                bus.rate_hz / 1_000_000,
                bus.microvolt,
                bus.avg,
                bus.peak,
                bus.hrt[0],
                bus.hrt[1],
                bus.channel_max,
                bus.dram_step
            )?;
            for port in self.ports().iter().filter(|p| p.channel.bus == index) {
                write!(
                    f,
                    "    {:<12} {:<12} {} avg {:>6} peak {:>6} mix {:>6}",
                    port.name, port.category, port.channel, port.avg, port.peak, port.mix
                )?;
                match port.limiter {
                    Some(limiter) => writeln!(f, " bwl {limiter:#x}")?,
                    None => writeln!(f)?,
                }
            }
        }
        Ok(())
    }
}

impl Topology {
    /// Tabular bandwidth history of every tracked entity.
    #[must_use]
    pub fn dump_history(&self) -> String {
        HistoryDump(self).to_string()
    }

    /// The single most recent larb / larb-port event.
    #[must_use]
    pub fn dump_last_larb(&self) -> String {
        LastLarbDump(self).to_string()
    }
}
