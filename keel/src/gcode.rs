use heapless::Vec;

/// Longest accepted command line, including the slot reserved for the terminator
pub const MAX_CMD_SIZE: usize = 96;

/// Where a command line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Interactive,
    Replay,
}

/// A command letter and number, e.g. `G1` or `M666`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub letter: u8,
    pub number: u16,
}

impl Command {
    pub const fn new(letter: u8, number: u16) -> Self {
        Self { letter, number }
    }
}

/// One letter/value pair of a command line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Field {
    pub letter: u8,
    pub value: Option<f64>,
}

/// A validated command line ready for dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecord {
    line: Vec<u8, MAX_CMD_SIZE>,
    origin: Origin,
    sequence: Option<i32>,
    checksum: Option<u8>,
}

impl CommandRecord {
    /// Builds a record from a terminated line with comments already removed
    ///
    /// Bytes past [`MAX_CMD_SIZE`] are dropped.
    pub fn new(line: &[u8], origin: Origin) -> Self {
        let mut stored = Vec::new();
        for b in line.iter().take(MAX_CMD_SIZE) {
            let _ = stored.push(*b);
        }
        let sequence = leading_sequence(line);
        let checksum = line
            .iter()
            .position(|b| *b == b'*')
            .and_then(|star| parse_int(&mut &line[star + 1..]))
            .and_then(|v| u8::try_from(v).ok());
        Self {
            line: stored,
            origin,
            sequence,
            checksum,
        }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Value of the leading `N` field, if any
    pub fn sequence(&self) -> Option<i32> {
        self.sequence
    }

    /// Value transmitted after `*`, if any
    pub fn checksum(&self) -> Option<u8> {
        self.checksum
    }

    /// The full line as received
    pub fn as_bytes(&self) -> &[u8] {
        &self.line
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.line).unwrap_or("")
    }

    /// The command text between the sequence field and the checksum
    pub fn body(&self) -> &[u8] {
        let mut data: &[u8] = &self.line;
        if let Some(star) = data.iter().position(|b| *b == b'*') {
            data = &data[..star];
        }
        data = trim(data);
        if self.sequence.is_some() {
            data = &data[1..];
            let _ = parse_int(&mut data);
        }
        trim(data)
    }

    /// Iterates the letter fields of the command body
    pub fn fields(&self) -> Fields<'_> {
        Fields { data: self.body() }
    }

    /// The first `G`, `M` or `T` field
    pub fn command(&self) -> Option<Command> {
        let field = self
            .fields()
            .find(|f| matches!(f.letter, b'G' | b'M' | b'T'))?;
        let number = field
            .value
            .filter(|v| *v >= 0.0 && *v <= f64::from(u16::MAX))?;
        Some(Command::new(field.letter, number as u16))
    }

    /// True if `letter` appears as a field
    pub fn has(&self, letter: u8) -> bool {
        self.fields().any(|f| f.letter == letter)
    }

    /// Numeric value of the first `letter` field
    pub fn value(&self, letter: u8) -> Option<f64> {
        self.fields().find(|f| f.letter == letter).and_then(|f| f.value)
    }

    /// Integer value of the first `letter` field, truncated toward zero
    pub fn value_i32(&self, letter: u8) -> Option<i32> {
        self.value(letter).map(|v| v as i32)
    }
}

/// Iterator over the fields of a command body
pub struct Fields<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for Fields<'a> {
    type Item = Field;

    fn next(&mut self) -> Option<Field> {
        loop {
            let letter = next_byte(&mut self.data)?;
            if letter.is_ascii_uppercase() {
                let value = parse_number(&mut self.data);
                return Some(Field { letter, value });
            }
        }
    }
}

/// XOR of every byte, as used by the line checksum
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

pub(crate) fn next_byte(data: &mut &[u8]) -> Option<u8> {
    let (first, rest) = data.split_first()?;
    *data = rest;
    Some(*first)
}

fn peek(data: &[u8]) -> Option<u8> {
    data.first().copied()
}

fn trim(mut data: &[u8]) -> &[u8] {
    while let Some((first, rest)) = data.split_first() {
        if !first.is_ascii_whitespace() {
            break;
        }
        data = rest;
    }
    while let Some((last, rest)) = data.split_last() {
        if !last.is_ascii_whitespace() {
            break;
        }
        data = rest;
    }
    data
}

fn skip_spaces(data: &mut &[u8]) {
    while peek(data) == Some(b' ') {
        *data = &data[1..];
    }
}

fn leading_sequence(line: &[u8]) -> Option<i32> {
    let mut data = trim(line);
    if next_byte(&mut data)? != b'N' {
        return None;
    }
    parse_int(&mut data)
}

fn digits(data: &mut &[u8]) -> (f64, usize) {
    let mut v = 0.0;
    let mut n = 0;
    while let Some(d) = peek(data).filter(u8::is_ascii_digit) {
        v = v * 10.0 + f64::from(d - b'0');
        n += 1;
        *data = &data[1..];
    }
    (v, n)
}

/// Parses a decimal integer, advancing `data` past it
///
/// On failure `data` is left untouched.
pub(crate) fn parse_int(data: &mut &[u8]) -> Option<i32> {
    let mut cursor = *data;
    skip_spaces(&mut cursor);
    let negative = match peek(cursor) {
        Some(b'-') => {
            cursor = &cursor[1..];
            true
        }
        Some(b'+') => {
            cursor = &cursor[1..];
            false
        }
        _ => false,
    };
    let (v, n) = digits(&mut cursor);
    if n == 0 || v > i32::MAX as f64 {
        return None;
    }
    *data = cursor;
    Some(if negative { -(v as i32) } else { v as i32 })
}

/// Parses a decimal number with optional sign and fraction, advancing `data` past it
///
/// On failure `data` is left untouched.
pub(crate) fn parse_number(data: &mut &[u8]) -> Option<f64> {
    let mut cursor = *data;
    skip_spaces(&mut cursor);
    let start = cursor;
    if matches!(peek(cursor), Some(b'-' | b'+')) {
        cursor = &cursor[1..];
    }
    let (_, mut n) = digits(&mut cursor);
    if peek(cursor) == Some(b'.') {
        cursor = &cursor[1..];
        n += digits(&mut cursor).1;
    }
    if n == 0 {
        return None;
    }
    let span = &start[..start.len() - cursor.len()];
    let v = core::str::from_utf8(span).ok()?.parse::<f64>().ok()?;
    *data = cursor;
    Some(v)
}
