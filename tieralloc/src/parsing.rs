//! Text serialization of an [`ApplicationProfile`], and the parser that
//! reads it back for offline-guided runs. The format is self-describing
//! and line-oriented so a past run's output file feeds straight back in
//! through `SH_PROFILE_INPUT_FILE`.

use std::io::{BufRead, Write};

use crate::error::ProfileError;
use crate::profile::data::{ApplicationProfile, ArenaProfile, SocketBw, Tier};

const ENVELOPE_BEGIN: &str = "===== BEGIN SICM PROFILING INFORMATION =====";
const ENVELOPE_END: &str = "===== END SICM PROFILING INFORMATION =====";

pub fn write_profile(
    profile: &ApplicationProfile,
    out: &mut impl Write,
    include_intervals: bool,
) -> std::io::Result<()> {
    writeln!(out, "{ENVELOPE_BEGIN}")?;
    writeln!(out, "Number of PROFILE_ALL events: {}", profile.events.len())?;
    writeln!(out, "Number of arenas: {}", profile.live_arenas().count())?;
    writeln!(out, "Upper capacity: {}", profile.upper_capacity_kb)?;
    writeln!(out, "Lower capacity: {}", profile.lower_capacity_kb)?;

    for arena in profile.live_arenas() {
        writeln!(out, "BEGIN ARENA {}", arena.index)?;
        writeln!(out, "  Number of allocation sites: {}", arena.sites.len())?;
        write!(out, "  Allocation sites: ")?;
        for site in &arena.sites {
            write!(out, "{site} ")?;
        }
        writeln!(out)?;
        writeln!(out, "  First interval: {}", arena.first_interval)?;
        writeln!(out, "  Number of intervals: {}", arena.num_intervals)?;

        if !profile.events.is_empty() {
            writeln!(out, "  BEGIN PROFILE_ALL")?;
            for (name, series) in profile.events.iter().zip(&arena.events) {
                writeln!(out, "    BEGIN EVENT {name}")?;
                writeln!(out, "      Total: {}", series.total)?;
                writeln!(out, "      Peak: {}", series.peak)?;
                if include_intervals {
                    write_intervals(out, "      ", &series.intervals)?;
                }
                writeln!(out, "    END EVENT {name}")?;
            }
            writeln!(out, "  END PROFILE_ALL")?;
        }

        for (block, peak, intervals) in [
            ("PROFILE_RSS", arena.rss.peak, &arena.rss.intervals),
            ("PROFILE_EXTENT_SIZE", arena.extent_size.peak, &arena.extent_size.intervals),
            ("PROFILE_ALLOCS", arena.allocs.peak, &arena.allocs.intervals),
            ("PROFILE_BW", arena.bw.peak, &arena.bw.intervals),
        ] {
            if intervals.is_empty() && peak == 0 {
                continue;
            }
            writeln!(out, "  BEGIN {block}")?;
            writeln!(out, "    Peak: {peak}")?;
            if include_intervals {
                write_intervals(out, "    ", intervals)?;
            }
            writeln!(out, "  END {block}")?;
        }

        if let Some(tier) = arena.tier {
            writeln!(out, "  BEGIN PROFILE_ONLINE")?;
            writeln!(
                out,
                "    Tier: {}",
                match tier {
                    Tier::Upper => "upper",
                    Tier::Lower => "lower",
                }
            )?;
            writeln!(out, "    Hot: {}", u8::from(arena.hot.unwrap_or(false)))?;
            writeln!(out, "  END PROFILE_ONLINE")?;
        }

        writeln!(out, "END ARENA {}", arena.index)?;
    }

    for skt in &profile.bw_skts {
        writeln!(out, "BEGIN SOCKET {}", skt.skt)?;
        writeln!(out, "  Peak: {}", skt.peak)?;
        if include_intervals {
            write_intervals(out, "  ", &skt.intervals)?;
        }
        writeln!(out, "END SOCKET {}", skt.skt)?;
    }

    writeln!(out, "{ENVELOPE_END}")?;
    Ok(())
}

fn write_intervals(out: &mut impl Write, indent: &str, intervals: &[u64]) -> std::io::Result<()> {
    write!(out, "{indent}Intervals: ")?;
    for v in intervals {
        write!(out, "{v} ")?;
    }
    writeln!(out)
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    line.trim_start().strip_prefix(name)?.strip_prefix(':').map(str::trim)
}

fn parse_field<T: std::str::FromStr>(line: &str, name: &str) -> Option<T> {
    field(line, name)?.parse().ok()
}

fn parse_u64_list(text: &str) -> Result<Vec<u64>, ProfileError> {
    text.split_whitespace()
        .map(|t| t.parse().map_err(|_| ProfileError::Parse(format!("bad number {t:?}"))))
        .collect()
}

/// What the parser is currently inside of.
enum Block {
    Arena,
    Events { cur: Option<usize> },
    Scalar(&'static str),
    Online,
}

/// Reads a profile previously written by [`write_profile`]. Anything
/// outside the envelope is ignored, so profiles embedded in a log stream
/// parse fine.
pub fn parse_profile(reader: impl BufRead) -> Result<ApplicationProfile, ProfileError> {
    let mut profile = ApplicationProfile::default();
    let mut in_envelope = false;
    let mut finished = false;
    let mut declared_arenas = 0usize;
    let mut arena: Option<ArenaProfile> = None;
    let mut block: Option<Block> = None;

    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();

        if !in_envelope {
            if trimmed == ENVELOPE_BEGIN {
                in_envelope = true;
            }
            continue;
        }
        if trimmed == ENVELOPE_END {
            finished = true;
            break;
        }

        // Innermost context first: the open sub-block of the open arena.
        if let Some(cur_arena) = arena.as_mut() {
            match block.as_mut() {
                Some(Block::Events { cur }) => {
                    if trimmed == "END PROFILE_ALL" {
                        block = Some(Block::Arena);
                    } else if let Some(name) = trimmed.strip_prefix("BEGIN EVENT ") {
                        let idx = profile
                            .events
                            .iter()
                            .position(|e| e == name)
                            .unwrap_or_else(|| {
                                profile.events.push(name.to_owned());
                                profile.events.len() - 1
                            });
                        while cur_arena.events.len() <= idx {
                            cur_arena.events.push(Default::default());
                        }
                        *cur = Some(idx);
                    } else if trimmed.starts_with("END EVENT ") {
                        *cur = None;
                    } else if let Some(idx) = *cur {
                        let series = &mut cur_arena.events[idx];
                        if let Some(v) = parse_field(trimmed, "Total") {
                            series.total = v;
                        } else if let Some(v) = parse_field(trimmed, "Peak") {
                            series.peak = v;
                        } else if let Some(rest) = field(trimmed, "Intervals") {
                            series.intervals = parse_u64_list(rest)?;
                        } else {
                            return Err(ProfileError::Parse(format!("in event block: {trimmed:?}")));
                        }
                    } else {
                        return Err(ProfileError::Parse(format!("in PROFILE_ALL: {trimmed:?}")));
                    }
                    continue;
                }
                Some(Block::Scalar(name)) => {
                    let series = match *name {
                        "PROFILE_RSS" => &mut cur_arena.rss,
                        "PROFILE_EXTENT_SIZE" => &mut cur_arena.extent_size,
                        "PROFILE_ALLOCS" => &mut cur_arena.allocs,
                        _ => &mut cur_arena.bw,
                    };
                    if trimmed == format!("END {name}") {
                        block = Some(Block::Arena);
                    } else if let Some(v) = parse_field(trimmed, "Peak") {
                        series.peak = v;
                    } else if let Some(rest) = field(trimmed, "Intervals") {
                        series.intervals = parse_u64_list(rest)?;
                    } else {
                        return Err(ProfileError::Parse(format!("in {name}: {trimmed:?}")));
                    }
                    continue;
                }
                Some(Block::Online) => {
                    if trimmed == "END PROFILE_ONLINE" {
                        block = Some(Block::Arena);
                    } else if let Some(tier) = field(trimmed, "Tier") {
                        cur_arena.tier = Some(match tier {
                            "upper" => Tier::Upper,
                            "lower" => Tier::Lower,
                            other => {
                                return Err(ProfileError::Parse(format!("bad tier {other:?}")))
                            }
                        });
                    } else if let Some(v) = parse_field::<u8>(trimmed, "Hot") {
                        cur_arena.hot = Some(v != 0);
                    } else {
                        return Err(ProfileError::Parse(format!("in PROFILE_ONLINE: {trimmed:?}")));
                    }
                    continue;
                }
                _ => {}
            }

            // Arena level.
            if trimmed.starts_with("END ARENA ") {
                let done = arena.take().unwrap();
                let index = done.index;
                if index >= profile.arenas.len() {
                    profile.arenas.resize(index + 1, None);
                }
                profile.arenas[index] = Some(done);
                block = None;
            } else if trimmed == "BEGIN PROFILE_ALL" {
                block = Some(Block::Events { cur: None });
            } else if trimmed == "BEGIN PROFILE_RSS" {
                block = Some(Block::Scalar("PROFILE_RSS"));
            } else if trimmed == "BEGIN PROFILE_EXTENT_SIZE" {
                block = Some(Block::Scalar("PROFILE_EXTENT_SIZE"));
            } else if trimmed == "BEGIN PROFILE_ALLOCS" {
                block = Some(Block::Scalar("PROFILE_ALLOCS"));
            } else if trimmed == "BEGIN PROFILE_BW" {
                block = Some(Block::Scalar("PROFILE_BW"));
            } else if trimmed == "BEGIN PROFILE_ONLINE" {
                block = Some(Block::Online);
            } else if let Some(v) = parse_field(trimmed, "First interval") {
                cur_arena.first_interval = v;
            } else if let Some(v) = parse_field(trimmed, "Number of intervals") {
                cur_arena.num_intervals = v;
            } else if parse_field::<usize>(trimmed, "Number of allocation sites").is_some() {
                // Implied by the site list itself.
            } else if let Some(rest) = field(trimmed, "Allocation sites") {
                cur_arena.sites = rest
                    .split_whitespace()
                    .map(|t| {
                        t.parse().map_err(|_| ProfileError::Parse(format!("bad site {t:?}")))
                    })
                    .collect::<Result<_, _>>()?;
            } else {
                return Err(ProfileError::Parse(format!("in arena: {trimmed:?}")));
            }
            continue;
        }

        // Top level of the envelope.
        if let Some(v) = parse_field(trimmed, "Number of PROFILE_ALL events") {
            let _: usize = v;
        } else if let Some(v) = parse_field(trimmed, "Number of arenas") {
            declared_arenas = v;
        } else if let Some(v) = parse_field(trimmed, "Upper capacity") {
            profile.upper_capacity_kb = v;
        } else if let Some(v) = parse_field(trimmed, "Lower capacity") {
            profile.lower_capacity_kb = v;
        } else if let Some(rest) = trimmed.strip_prefix("BEGIN ARENA ") {
            let index = rest
                .trim()
                .parse()
                .map_err(|_| ProfileError::Parse(format!("bad arena index {rest:?}")))?;
            arena = Some(ArenaProfile { index, ..Default::default() });
            block = Some(Block::Arena);
        } else if let Some(rest) = trimmed.strip_prefix("BEGIN SOCKET ") {
            let skt = rest
                .trim()
                .parse()
                .map_err(|_| ProfileError::Parse(format!("bad socket {rest:?}")))?;
            profile.bw_skts.push(SocketBw { skt, ..Default::default() });
        } else if let Some(v) = parse_field(trimmed, "Peak") {
            if let Some(last) = profile.bw_skts.last_mut() {
                last.peak = v;
            }
        } else if let Some(rest) = field(trimmed, "Intervals") {
            if let Some(last) = profile.bw_skts.last_mut() {
                last.intervals = parse_u64_list(rest)?;
            }
        } else if trimmed.starts_with("END SOCKET ") {
            // Nothing held open.
        } else {
            return Err(ProfileError::Parse(format!("unexpected line {trimmed:?}")));
        }
    }

    if !finished {
        return Err(ProfileError::Parse("no profiling envelope found".into()));
    }
    let live = profile.live_arenas().count();
    if declared_arenas != live {
        return Err(ProfileError::Parse(format!(
            "declared {declared_arenas} arenas, found {live}"
        )));
    }
    profile.num_intervals =
        profile.live_arenas().map(|a| a.first_interval + a.num_intervals).max().unwrap_or(0);
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::data::{EventSeries, ScalarSeries};
    use std::io::Cursor;

    fn sample_profile() -> ApplicationProfile {
        let mut p = ApplicationProfile::new(
            vec!["MEM_LOAD_UOPS_RETIRED.LOCAL_DRAM".into(), "fake_event".into()],
            8,
            &[0, 1],
        );
        p.upper_capacity_kb = 1024;
        p.lower_capacity_kb = 4096;

        let a = p.arena_mut(0, 0);
        a.sites = vec![7];
        a.num_intervals = 3;
        a.events[0] = {
            let mut s = EventSeries::default();
            s.push(5);
            s.push(11);
            s.push_skip();
            s
        };
        a.events[1] = {
            let mut s = EventSeries::default();
            s.push(0);
            s.push(2);
            s.push(2);
            s
        };
        a.rss = {
            let mut s = ScalarSeries::default();
            s.push(4096);
            s.push(8192);
            s.push(8192);
            s
        };
        a.tier = Some(Tier::Upper);
        a.hot = Some(true);

        let b = p.arena_mut(3, 1);
        b.sites = vec![9, 12];
        b.num_intervals = 2;
        b.events[0].push(1);
        b.events[0].push(1);
        b.extent_size.push(1 << 20);
        b.extent_size.push(1 << 20);

        p.bw_skts[0].peak = 777;
        p.bw_skts[0].intervals = vec![100, 777, 50];
        p.num_intervals = 3;
        p
    }

    #[test]
    fn round_trip_preserves_everything() {
        let profile = sample_profile();
        let mut buf = Vec::new();
        write_profile(&profile, &mut buf, true).unwrap();
        let parsed = parse_profile(Cursor::new(&buf)).unwrap();

        assert_eq!(parsed.events, profile.events);
        assert_eq!(parsed.upper_capacity_kb, 1024);
        assert_eq!(parsed.live_arenas().count(), 2);

        let a = parsed.arenas[0].as_ref().unwrap();
        assert_eq!(a.sites, vec![7]);
        assert_eq!(a.num_intervals, 3);
        assert_eq!(a.events[0].intervals, vec![5, 11, 11]);
        assert_eq!(a.events[0].total, 27);
        assert_eq!(a.rss.peak, 8192);
        assert_eq!(a.tier, Some(Tier::Upper));
        assert_eq!(a.hot, Some(true));

        let b = parsed.arenas[3].as_ref().unwrap();
        assert_eq!(b.sites, vec![9, 12]);
        assert_eq!(b.extent_size.intervals, vec![1 << 20, 1 << 20]);

        assert_eq!(parsed.bw_skts.len(), 2);
        assert_eq!(parsed.bw_skts[0].intervals, vec![100, 777, 50]);
    }

    #[test]
    fn interval_sums_equal_totals_after_round_trip() {
        let profile = sample_profile();
        let mut buf = Vec::new();
        write_profile(&profile, &mut buf, true).unwrap();
        let parsed = parse_profile(Cursor::new(&buf)).unwrap();

        for arena in parsed.live_arenas() {
            for series in &arena.events {
                assert_eq!(series.total, series.intervals.iter().sum::<u64>());
            }
        }
    }

    #[test]
    fn parses_without_interval_sequences() {
        let profile = sample_profile();
        let mut buf = Vec::new();
        write_profile(&profile, &mut buf, false).unwrap();
        let parsed = parse_profile(Cursor::new(&buf)).unwrap();
        let a = parsed.arenas[0].as_ref().unwrap();
        assert_eq!(a.events[0].total, 27);
        assert!(a.events[0].intervals.is_empty());
    }

    #[test]
    fn surrounding_log_noise_is_ignored() {
        let profile = sample_profile();
        let mut buf = Vec::new();
        buf.extend_from_slice(b"some log line\n");
        write_profile(&profile, &mut buf, true).unwrap();
        buf.extend_from_slice(b"trailing noise\n");
        assert!(parse_profile(Cursor::new(&buf)).is_ok());
    }

    #[test]
    fn truncated_input_is_rejected() {
        let profile = sample_profile();
        let mut buf = Vec::new();
        write_profile(&profile, &mut buf, true).unwrap();
        let cut = buf.len() / 2;
        assert!(parse_profile(Cursor::new(&buf[..cut])).is_err());
    }
}
