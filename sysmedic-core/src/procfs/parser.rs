//! Pure parsers for `/proc` file contents. Tolerates trailing whitespace,
//! kernel-version field additions, and missing optional fields (spec §6).

/// Error produced while parsing a `/proc` file's content.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

/// Aggregate CPU jiffy counters from the first line of `/proc/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    pub fn idle_total(&self) -> u64 {
        self.idle + self.iowait
    }
}

/// Parses the aggregate `cpu` line of `/proc/stat` (not the per-core lines).
pub fn parse_proc_stat_cpu(content: &str) -> Result<CpuTimes, ParseError> {
    let line = content
        .lines()
        .find(|l| l.trim_start().starts_with("cpu "))
        .ok_or_else(|| ParseError::new("no aggregate 'cpu' line in /proc/stat"))?;

    let fields: Vec<&str> = line.split_whitespace().skip(1).collect();
    if fields.len() < 8 {
        return Err(ParseError::new("not enough fields on cpu line"));
    }
    let f = |i: usize| -> Result<u64, ParseError> {
        fields
            .get(i)
            .ok_or_else(|| ParseError::new("missing cpu field"))?
            .parse()
            .map_err(|_| ParseError::new("invalid cpu field"))
    };
    Ok(CpuTimes {
        user: f(0)?,
        nice: f(1)?,
        system: f(2)?,
        idle: f(3)?,
        iowait: f(4)?,
        irq: f(5)?,
        softirq: f(6)?,
        steal: f(7)?,
    })
}

/// Selected fields of `/proc/meminfo`, in kB as reported by the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemInfo {
    pub mem_total_kb: u64,
    pub mem_free_kb: u64,
    pub buffers_kb: u64,
    pub cached_kb: u64,
}

pub fn parse_meminfo(content: &str) -> Result<MemInfo, ParseError> {
    let mut info = MemInfo::default();
    let mut seen_total = false;
    for line in content.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let value_kb = rest
            .trim()
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<u64>().ok());
        let Some(value_kb) = value_kb else { continue };
        match key.trim() {
            "MemTotal" => {
                info.mem_total_kb = value_kb;
                seen_total = true;
            }
            "MemFree" => info.mem_free_kb = value_kb,
            "Buffers" => info.buffers_kb = value_kb,
            "Cached" => info.cached_kb = value_kb,
            _ => {}
        }
    }
    if !seen_total {
        return Err(ParseError::new("missing MemTotal in /proc/meminfo"));
    }
    Ok(info)
}

/// The three load averages from `/proc/loadavg`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadAvg {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

pub fn parse_loadavg(content: &str) -> Result<LoadAvg, ParseError> {
    let fields: Vec<&str> = content.trim().split_whitespace().collect();
    if fields.len() < 3 {
        return Err(ParseError::new("not enough fields in /proc/loadavg"));
    }
    let parse = |s: &str| s.parse::<f64>().map_err(|_| ParseError::new("invalid load average"));
    Ok(LoadAvg {
        one: parse(fields[0])?,
        five: parse(fields[1])?,
        fifteen: parse(fields[2])?,
    })
}

/// Sum of rx+tx bytes across all non-loopback interfaces in `/proc/net/dev`.
pub fn parse_net_dev_total_bytes(content: &str) -> Result<u64, ParseError> {
    let mut total = 0u64;
    let mut any = false;
    for line in content.lines().skip(2) {
        let Some((iface, rest)) = line.split_once(':') else {
            continue;
        };
        let iface = iface.trim();
        if iface.is_empty() || iface == "lo" {
            continue;
        }
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }
        let rx: u64 = fields[0].parse().unwrap_or(0);
        let tx: u64 = fields[8].parse().unwrap_or(0);
        total = total.saturating_add(rx).saturating_add(tx);
        any = true;
    }
    if !any {
        return Err(ParseError::new("no non-loopback interfaces in /proc/net/dev"));
    }
    Ok(total)
}

/// The subset of `/proc/<pid>/stat` fields this collector needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcStat {
    pub pid: u32,
    pub utime: u64,
    pub stime: u64,
}

/// Parses `/proc/<pid>/stat`. The `comm` field may contain spaces and
/// parentheses, so the comm boundaries are located before splitting the
/// rest on whitespace.
pub fn parse_proc_pid_stat(content: &str) -> Result<ProcStat, ParseError> {
    let content = content.trim();
    let open_paren = content
        .find('(')
        .ok_or_else(|| ParseError::new("missing '(' in stat"))?;
    let close_paren = content
        .rfind(')')
        .ok_or_else(|| ParseError::new("missing ')' in stat"))?;
    if close_paren <= open_paren {
        return Err(ParseError::new("invalid parentheses in stat"));
    }

    let pid: u32 = content[..open_paren]
        .trim()
        .parse()
        .map_err(|_| ParseError::new("invalid pid"))?;

    let fields: Vec<&str> = content[close_paren + 1..].split_whitespace().collect();
    // state(0) ppid(1) pgrp(2) session(3) tty_nr(4) tpgid(5) flags(6)
    // minflt(7) cminflt(8) majflt(9) cmajflt(10) utime(11) stime(12)
    if fields.len() < 13 {
        return Err(ParseError::new("not enough fields in stat"));
    }
    let utime: u64 = fields[11]
        .parse()
        .map_err(|_| ParseError::new("invalid utime"))?;
    let stime: u64 = fields[12]
        .parse()
        .map_err(|_| ParseError::new("invalid stime"))?;

    Ok(ProcStat { pid, utime, stime })
}

/// `/proc/<pid>/status` fields this collector needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcStatus {
    pub uid: Option<u32>,
    pub vm_rss_kb: u64,
}

pub fn parse_proc_pid_status(content: &str) -> Result<ProcStatus, ParseError> {
    let mut status = ProcStatus::default();
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "Uid" => {
                // Format: real effective saved fs — take the real UID.
                if let Some(real) = value.trim().split_whitespace().next() {
                    status.uid = real.parse().ok();
                }
            }
            "VmRSS" => {
                if let Some(kb) = value.trim().split_whitespace().next() {
                    status.vm_rss_kb = kb.parse().unwrap_or(0);
                }
            }
            _ => {}
        }
    }
    Ok(status)
}
