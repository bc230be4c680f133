//! Parser for the xlogfile the game engine appends one line to per
//! completed game.
//!
//! Each line is a series of `key=value` fields, tab-separated in modern
//! variants and colon-separated in older ones. The file is written by an
//! out-of-process game under a different uid, so every line is untrusted
//! input: anything unparseable is skipped, never fatal.
//!
//! Example line (tab-separated):
//! `version=3.6.6\tpoints=1234\tuid=1000\tname=player\tdeath=killed by a jackal\tturns=100`

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Death text substring that marks a winning game.
pub const DEFAULT_WIN_KEYWORD: &str = "ascended";

/// Play-mode bits from the xlogfile `flags` field, decoded once instead of
/// bit-tested all over the completion path. Either bit marks the run as
/// cheat-flagged: recorded for transparency, never scored, never paid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GameFlags {
    pub wizard: bool,
    pub explore: bool,
}

impl GameFlags {
    const WIZARD_BIT: u64 = 0x1;
    const EXPLORE_BIT: u64 = 0x2;

    /// Decode the raw `flags` value, accepting `0x…` hex or plain decimal.
    /// Unparseable input decodes to no flags rather than poisoning the
    /// whole record.
    pub fn decode(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return GameFlags::default();
        };
        let raw = raw.trim();
        let bits = if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            u64::from_str_radix(hex, 16).unwrap_or(0)
        } else {
            raw.parse::<u64>().unwrap_or(0)
        };
        GameFlags {
            wizard: bits & Self::WIZARD_BIT != 0,
            explore: bits & Self::EXPLORE_BIT != 0,
        }
    }

    pub fn cheat_flagged(&self) -> bool {
        self.wizard || self.explore
    }

    /// Label used to tag the recorded death text of a cheat-flagged run.
    pub fn mode_label(&self) -> Option<&'static str> {
        if self.wizard {
            Some("WIZARD MODE")
        } else if self.explore {
            Some("EXPLORE MODE")
        } else {
            None
        }
    }
}

/// One parsed xlogfile line. `uid` is the correlation key joining the
/// record back to a session; everything else feeds the recorded outcome.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct XlogRecord {
    pub version: Option<String>,
    pub points: i64,
    pub deathdnum: Option<i64>,
    pub deathlev: Option<i64>,
    pub maxlvl: Option<i64>,
    pub hp: Option<i64>,
    pub maxhp: Option<i64>,
    pub deaths: Option<i64>,
    pub deathdate: Option<String>,
    pub birthdate: Option<String>,
    pub uid: Option<u32>,
    pub role: Option<String>,
    pub race: Option<String>,
    pub gender: Option<String>,
    pub align: Option<String>,
    pub name: String,
    pub death: String,
    pub conduct: Option<String>,
    pub turns: i64,
    pub achieve: Option<String>,
    pub realtime: Option<i64>,
    pub starttime: Option<i64>,
    pub endtime: Option<i64>,
    pub flags: GameFlags,
}

impl XlogRecord {
    pub fn won(&self, win_keyword: &str) -> bool {
        !win_keyword.is_empty()
            && self
                .death
                .to_lowercase()
                .contains(&win_keyword.to_lowercase())
    }

    pub fn score(&self) -> i64 {
        self.points
    }
}

fn int_field(data: &HashMap<&str, &str>, key: &str) -> Result<Option<i64>, ()> {
    match data.get(key) {
        None => Ok(None),
        Some(raw) => raw.parse::<i64>().map(Some).map_err(|_| ()),
    }
}

fn uint_field(data: &HashMap<&str, &str>, key: &str) -> Result<Option<u32>, ()> {
    match data.get(key) {
        None => Ok(None),
        Some(raw) => raw.parse::<u32>().map(Some).map_err(|_| ()),
    }
}

fn text_field(data: &HashMap<&str, &str>, key: &str) -> Option<String> {
    data.get(key).map(|value| value.to_string())
}

/// Parse one xlogfile line. Returns `None` for empty lines, lines with no
/// `key=value` fields, and lines whose numeric fields are malformed.
pub fn parse_line(line: &str) -> Option<XlogRecord> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    // Tab is the primary delimiter; fall back to colons for older variants.
    // Values may contain the delimiter themselves, so each field is split
    // on the first '=' and fragments without one are skipped.
    let fields: Vec<&str> = if line.contains('\t') {
        line.split('\t').collect()
    } else {
        line.split(':').collect()
    };

    let mut data: HashMap<&str, &str> = HashMap::new();
    for field in fields {
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if !key.is_empty() {
            data.insert(key, value.trim());
        }
    }
    if data.is_empty() {
        return None;
    }

    let record = XlogRecord {
        version: text_field(&data, "version"),
        points: int_field(&data, "points").ok()?.unwrap_or(0),
        deathdnum: int_field(&data, "deathdnum").ok()?,
        deathlev: int_field(&data, "deathlev").ok()?,
        maxlvl: int_field(&data, "maxlvl").ok()?,
        hp: int_field(&data, "hp").ok()?,
        maxhp: int_field(&data, "maxhp").ok()?,
        deaths: int_field(&data, "deaths").ok()?,
        deathdate: text_field(&data, "deathdate"),
        birthdate: text_field(&data, "birthdate"),
        uid: uint_field(&data, "uid").ok()?,
        role: text_field(&data, "role"),
        race: text_field(&data, "race"),
        gender: text_field(&data, "gender"),
        align: text_field(&data, "align"),
        name: text_field(&data, "name").unwrap_or_default(),
        death: text_field(&data, "death").unwrap_or_default(),
        conduct: text_field(&data, "conduct"),
        turns: int_field(&data, "turns").ok()?.unwrap_or(0),
        achieve: text_field(&data, "achieve"),
        realtime: int_field(&data, "realtime").ok()?,
        starttime: int_field(&data, "starttime").ok()?,
        endtime: int_field(&data, "endtime").ok()?,
        flags: GameFlags::decode(data.get("flags").copied()),
    };
    Some(record)
}

/// Read and parse everything appended since `since_offset`, returning the
/// records and the new byte offset for the caller to hold on to.
///
/// A missing file yields `([], 0)`. An offset past end-of-file means the
/// file was truncated or rewritten; the read restarts from byte 0.
pub fn read_new_records(path: &Path, since_offset: u64) -> io::Result<(Vec<XlogRecord>, u64)> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(err) => return Err(err),
    };
    let len = file.metadata()?.len();
    let offset = if since_offset > len { 0 } else { since_offset };
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let new_offset = offset + buf.len() as u64;
    let text = String::from_utf8_lossy(&buf);
    let records = text.lines().filter_map(parse_line).collect();
    Ok((records, new_offset))
}

/// Cursor over the xlogfile. The offset lives in memory for the life of
/// the watcher and only moves forward, so no byte range is parsed twice
/// within one run.
pub struct XlogWatcher {
    path: PathBuf,
    offset: u64,
}

impl XlogWatcher {
    /// Watcher starting at the current end of file: games finished before
    /// the watcher existed are not replayed.
    pub fn new(path: PathBuf) -> Self {
        let offset = fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
        XlogWatcher { path, offset }
    }

    pub fn from_offset(path: PathBuf, offset: u64) -> Self {
        XlogWatcher { path, offset }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Parse everything appended since the last poll and advance the cursor.
    pub fn poll(&mut self) -> io::Result<Vec<XlogRecord>> {
        let (records, new_offset) = read_new_records(&self.path, self.offset)?;
        self.offset = new_offset;
        Ok(records)
    }

    /// Skip ahead to the current end of file.
    pub fn reset(&mut self) {
        self.offset = fs::metadata(&self.path).map(|meta| meta.len()).unwrap_or(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_tab_separated_line() {
        let line = "version=3.6.6\tpoints=1234\tname=player\tdeath=killed by a jackal\tturns=100";
        let record = parse_line(line).unwrap();
        assert_eq!(record.version.as_deref(), Some("3.6.6"));
        assert_eq!(record.points, 1234);
        assert_eq!(record.name, "player");
        assert_eq!(record.death, "killed by a jackal");
        assert_eq!(record.turns, 100);
        assert_eq!(record.score(), 1234);
        assert!(!record.won(DEFAULT_WIN_KEYWORD));
    }

    #[test]
    fn crafted_record_round_trip() {
        let line = "points=1234\tname=Hero\tdeath=ascended\tturns=100\tuid=42";
        let record = parse_line(line).unwrap();
        assert_eq!(record.points, 1234);
        assert_eq!(record.name, "Hero");
        assert!(record.won(DEFAULT_WIN_KEYWORD));
        assert_eq!(record.turns, 100);
        assert_eq!(record.uid, Some(42));
    }

    #[test]
    fn win_keyword_is_case_insensitive() {
        let record = parse_line("points=1\tname=w\tdeath=Ascended to demigoddess-hood").unwrap();
        assert!(record.won(DEFAULT_WIN_KEYWORD));
        assert!(record.won("ASCENDED"));
        assert!(!record.won("escaped"));
    }

    #[test]
    fn death_text_keeps_embedded_punctuation() {
        let line =
            "version=3.6.6\tpoints=100\tname=player\tdeath=killed by a soldier ant, while helpless\tturns=50";
        let record = parse_line(line).unwrap();
        assert_eq!(record.death, "killed by a soldier ant, while helpless");
    }

    #[test]
    fn colon_separated_fallback() {
        let line = "version=3.4.3:points=500:name=old:death=quit:turns=20";
        let record = parse_line(line).unwrap();
        assert_eq!(record.version.as_deref(), Some("3.4.3"));
        assert_eq!(record.points, 500);
        assert_eq!(record.death, "quit");
    }

    #[test]
    fn colon_fallback_skips_delimiter_fragments() {
        // A colon inside a value splits off a fragment with no '='; the
        // fragment is dropped, the line still parses.
        let line = "points=100:name=p:death=killed by: something:turns=5";
        let record = parse_line(line).unwrap();
        assert_eq!(record.death, "killed by");
        assert_eq!(record.turns, 5);
    }

    #[test]
    fn malformed_lines_yield_none_not_panic() {
        assert!(parse_line("").is_none());
        assert!(parse_line("   \n").is_none());
        assert!(parse_line("no equals signs here").is_none());
        assert!(parse_line(":::").is_none());
        assert!(parse_line("\t\t\t").is_none());
        // Malformed numeric field invalidates the whole record.
        assert!(parse_line("points=abc\tname=x").is_none());
        assert!(parse_line("points=1\tuid=-5\tname=x").is_none());
    }

    #[test]
    fn full_entry_parses() {
        let line = "version=3.6.6\tpoints=5000\tdeathdnum=0\tdeathlev=5\tmaxlvl=7\thp=-3\t\
                    maxhp=42\tdeaths=1\tdeathdate=20240115\tbirthdate=20240115\tuid=1000\t\
                    role=Val\trace=Hum\tgender=Fem\talign=Neu\tname=testplayer\t\
                    death=killed by a gnome lord\tconduct=0x0\tturns=2500\tachieve=0x0\t\
                    realtime=1800\tstarttime=1705312345\tendtime=1705314145\tgender0=Fem\t\
                    align0=Neu\tflags=0x0";
        let record = parse_line(line).unwrap();
        assert_eq!(record.deathlev, Some(5));
        assert_eq!(record.maxlvl, Some(7));
        assert_eq!(record.hp, Some(-3));
        assert_eq!(record.maxhp, Some(42));
        assert_eq!(record.uid, Some(1000));
        assert_eq!(record.role.as_deref(), Some("Val"));
        assert_eq!(record.race.as_deref(), Some("Hum"));
        assert_eq!(record.align.as_deref(), Some("Neu"));
        assert_eq!(record.turns, 2500);
        assert_eq!(record.realtime, Some(1800));
        assert!(!record.flags.cheat_flagged());
    }

    #[test]
    fn flags_decode_hex_and_decimal() {
        assert!(GameFlags::decode(Some("0x1")).wizard);
        assert!(!GameFlags::decode(Some("0x1")).explore);
        assert!(GameFlags::decode(Some("0x2")).explore);
        assert!(GameFlags::decode(Some("0x3")).wizard);
        assert!(GameFlags::decode(Some("0x3")).explore);
        assert!(GameFlags::decode(Some("1")).wizard);
        assert!(GameFlags::decode(Some("2")).explore);
        assert!(!GameFlags::decode(Some("0x0")).cheat_flagged());
        assert!(!GameFlags::decode(Some("0x4")).cheat_flagged());
        assert!(!GameFlags::decode(Some("garbage")).cheat_flagged());
        assert!(!GameFlags::decode(None).cheat_flagged());
    }

    #[test]
    fn cheat_mode_labels() {
        assert_eq!(GameFlags::decode(Some("0x1")).mode_label(), Some("WIZARD MODE"));
        assert_eq!(GameFlags::decode(Some("0x2")).mode_label(), Some("EXPLORE MODE"));
        // Wizard wins when both bits are set.
        assert_eq!(GameFlags::decode(Some("0x3")).mode_label(), Some("WIZARD MODE"));
        assert_eq!(GameFlags::decode(Some("0x0")).mode_label(), None);
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let (records, offset) =
            read_new_records(Path::new("/nonexistent/xlogfile"), 0).unwrap();
        assert!(records.is_empty());
        assert_eq!(offset, 0);
    }

    #[test]
    fn tail_reads_only_new_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xlogfile");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "points=100\tname=one\tdeath=died\tturns=10\tuid=1").unwrap();

        let (records, first_offset) = read_new_records(&path, 0).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "one");

        writeln!(file, "points=200\tname=two\tdeath=died\tturns=20\tuid=2").unwrap();
        let (records, second_offset) = read_new_records(&path, first_offset).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "two");
        assert!(second_offset > first_offset);

        // No new writes: empty batch, same offset.
        let (records, third_offset) = read_new_records(&path, second_offset).unwrap();
        assert!(records.is_empty());
        assert_eq!(third_offset, second_offset);
    }

    #[test]
    fn offset_past_eof_restarts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xlogfile");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "points=100\tname=one\tdeath=died\tturns=10").unwrap();

        let (records, offset) = read_new_records(&path, 10_000).unwrap();
        assert_eq!(records.len(), 1);
        assert!(offset > 0);
        assert!(offset < 10_000);
    }

    #[test]
    fn bad_lines_are_skipped_within_a_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xlogfile");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "points=100\tname=ok\tdeath=died\tturns=10").unwrap();
        writeln!(file, "total garbage").unwrap();
        writeln!(file, "points=abc\tname=bad").unwrap();
        writeln!(file, "points=300\tname=alsook\tdeath=died\tturns=30").unwrap();

        let (records, _) = read_new_records(&path, 0).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "ok");
        assert_eq!(records[1].name, "alsook");
    }

    #[test]
    fn watcher_starts_at_end_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xlogfile");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "points=100\tname=old\tdeath=died\tturns=10").unwrap();

        let mut watcher = XlogWatcher::new(path.clone());
        assert!(watcher.poll().unwrap().is_empty());

        writeln!(file, "points=200\tname=new\tdeath=died\tturns=20").unwrap();
        let records = watcher.poll().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "new");
        assert!(watcher.poll().unwrap().is_empty());
    }

    #[test]
    fn watcher_reset_skips_unread_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xlogfile");
        let mut file = File::create(&path).unwrap();

        let mut watcher = XlogWatcher::from_offset(path.clone(), 0);
        writeln!(file, "points=100\tname=skipped\tdeath=died\tturns=10").unwrap();
        watcher.reset();
        assert!(watcher.poll().unwrap().is_empty());
    }
}
