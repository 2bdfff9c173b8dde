use super::{Event, LogParser, ParserOptions};
use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};

#[allow(clippy::expect_used)]
fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("valid slow log regex")
}

static USER_HOST: Lazy<Regex> =
    Lazy::new(|| re(r"User@Host: ([^\[\s]*)\[[^\]]*\] @ (\S*)\s*\[([^\]]*)\]"));
static KEY_VALUE: Lazy<Regex> = Lazy::new(|| re(r"(\w+): (\S+)"));
static USE_DB: Lazy<Regex> = Lazy::new(|| re(r"(?i)\Ause\s+`?([^`;\s]+)`?;?\z"));
static SET_TIMESTAMP: Lazy<Regex> = Lazy::new(|| re(r"(?i)\ASET\s+timestamp\s*=\s*(\d+);?\z"));

/// Line parser for the MySQL / Percona Server slow query log format.
pub struct SlowLogParser<R> {
    reader: R,
    offset: u64,
    filter_admin: bool,
    synced: bool,
    pending: Option<(u64, String)>,
    buf: Vec<u8>,
}

impl SlowLogParser<BufReader<File>> {
    /// Parse `file` starting at `opts.start_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be positioned at the start offset.
    pub fn new(mut file: File, opts: &ParserOptions) -> Result<Self> {
        file.seek(SeekFrom::Start(opts.start_offset))?;
        Ok(Self::from_reader(BufReader::new(file), opts))
    }
}

impl<R: BufRead> SlowLogParser<R> {
    /// `reader` must already be positioned at `opts.start_offset`.
    pub fn from_reader(reader: R, opts: &ParserOptions) -> Self {
        Self {
            reader,
            offset: opts.start_offset,
            filter_admin: opts.filter_admin_commands,
            synced: opts.start_offset == 0,
            pending: None,
            buf: Vec::with_capacity(1024),
        }
    }

    fn read_line(&mut self) -> Result<Option<(u64, String)>> {
        if let Some(line) = self.pending.take() {
            return Ok(Some(line));
        }

        self.buf.clear();
        let n = self.reader.read_until(b'\n', &mut self.buf)?;
        if n == 0 {
            return Ok(None);
        }

        let start = self.offset;
        self.offset += n as u64;
        let line = String::from_utf8_lossy(&self.buf)
            .trim_end_matches(['\r', '\n'])
            .to_string();

        Ok(Some((start, line)))
    }

    fn parse_one(&mut self) -> Result<Option<Event>> {
        let mut event: Option<Event> = None;
        let mut in_query = false;
        let mut query: Vec<String> = Vec::new();

        while let Some((offset, line)) = self.read_line()? {
            // Mid-file starts may land inside an event; skip to the next header.
            if !self.synced {
                if !is_event_header(&line) {
                    continue;
                }
                self.synced = true;
            }

            // A restart banner ends the statement it was appended to.
            if is_banner(&line) {
                if in_query {
                    break;
                }
                continue;
            }

            if line.starts_with('#') {
                if in_query {
                    self.pending = Some((offset, line));
                    break;
                }

                let ev = event.get_or_insert_with(|| Event {
                    offset,
                    ..Event::default()
                });

                if let Some(cmd) = line.strip_prefix("# administrator command: ") {
                    ev.admin = true;
                    query.push(format!("administrator command: {cmd}"));
                    in_query = true;
                } else {
                    parse_header(ev, &line);
                }
                continue;
            }

            let ev = event.get_or_insert_with(|| Event {
                offset,
                ..Event::default()
            });

            if !in_query {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Some(db) = USE_DB.captures(trimmed).and_then(|c| c.get(1)) {
                    ev.db = db.as_str().to_string();
                    continue;
                }
                if let Some(ts) = SET_TIMESTAMP
                    .captures(trimmed)
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse::<i64>().ok())
                {
                    ev.ts = Utc.timestamp_opt(ts, 0).single();
                    continue;
                }
            }

            in_query = true;
            query.push(line);
        }

        match event {
            Some(mut ev) if in_query => {
                ev.query = query
                    .join("\n")
                    .trim()
                    .trim_end_matches(';')
                    .trim_end()
                    .to_string();
                Ok(Some(ev))
            }
            // A header with no statement yet is still being written.
            _ => Ok(None),
        }
    }
}

impl<R: BufRead + Send> LogParser for SlowLogParser<R> {
    fn next_event(&mut self) -> Result<Option<Event>> {
        loop {
            match self.parse_one()? {
                Some(ev) if ev.admin && self.filter_admin => {}
                other => return Ok(other),
            }
        }
    }

    fn offset(&self) -> u64 {
        self.offset
    }
}

fn is_event_header(line: &str) -> bool {
    line.starts_with("# Time:") || line.starts_with("# User@Host:")
}

fn is_banner(line: &str) -> bool {
    line.contains("started with:")
        || line.starts_with("Tcp port:")
        || (line.starts_with("Time ") && line.contains("Id Command"))
}

fn parse_header(ev: &mut Event, line: &str) {
    if let Some(time) = line.strip_prefix("# Time:") {
        let time = time.split_whitespace().collect::<Vec<_>>().join(" ");
        if let Ok(dt) = DateTime::parse_from_rfc3339(&time) {
            ev.ts = Some(dt.with_timezone(&Utc));
        } else if let Ok(local) = NaiveDateTime::parse_from_str(&time, "%y%m%d %H:%M:%S") {
            ev.local_time = Some(local);
        }
        return;
    }

    if let Some(caps) = USER_HOST.captures(line) {
        ev.user = caps.get(1).map_or_else(String::new, |m| m.as_str().to_string());
        let host = caps.get(2).map_or("", |m| m.as_str());
        let ip = caps.get(3).map_or("", |m| m.as_str());
        ev.host = if host.is_empty() { ip } else { host }.to_string();
        return;
    }

    for caps in KEY_VALUE.captures_iter(line) {
        let (Some(key), Some(val)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        let (key, val) = (key.as_str(), val.as_str());

        match key {
            "Schema" => ev.db = val.to_string(),
            "Log_slow_rate_type" => ev.rate_type = Some(val.to_string()),
            "Log_slow_rate_limit" => ev.rate_limit = val.parse().unwrap_or(0),
            _ if val == "Yes" || val == "No" => {
                ev.bool_metrics.insert(key.to_string(), val == "Yes");
            }
            _ if key.ends_with("_time") || key.ends_with("_wait") => {
                if let Ok(v) = val.parse::<f64>() {
                    ev.time_metrics.insert(key.to_string(), v);
                }
            }
            _ => {
                if let Ok(v) = val.parse::<u64>() {
                    ev.number_metrics.insert(key.to_string(), v);
                }
            }
        }
    }
}
