//! Quick SoundFont header inspection.
//!
//! The control plane never decodes sample data; it only needs the INFO
//! strings and the preset headers to present sounds to the user and to
//! validate uploads. This module walks the RIFF structure just far enough
//! to collect those, skipping sample chunks by size.
//!
//! Vielle-specific SoundFonts announce themselves with "midigurdy" in the
//! product field. They place sounds in fixed banks (0 melody, 1 drone,
//! 2 trompette, 3 keynoise) and may declare natural base notes with
//! `basenote <bank>:<prog> <note>` commands inside the comment field.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SoundFontError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid soundfont: {0}")]
    Format(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundFontMode {
    Midigurdy,
    Generic,
}

impl SoundFontMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SoundFontMode::Midigurdy => "midigurdy",
            SoundFontMode::Generic => "generic",
        }
    }
}

/// One selectable preset inside a SoundFont.
#[derive(Debug, Clone)]
pub struct Sound {
    pub bank: i32,
    pub program: i32,
    pub name: String,
    pub kind: &'static str,
    pub base_note: i32,
}

/// Header-level view of a SoundFont file.
#[derive(Debug, Clone)]
pub struct SoundFont {
    pub id: String,
    pub filename: String,
    pub filepath: PathBuf,
    pub filesize: u64,
    pub name: String,
    pub copyright: String,
    pub creation_date: String,
    pub author: String,
    pub tool: String,
    pub description: String,
    pub mode: SoundFontMode,
    pub sounds: Vec<Sound>,
}

impl SoundFont {
    /// Parse the headers of a SoundFont file.
    pub fn load(filepath: &Path) -> Result<Self, SoundFontError> {
        let filesize = std::fs::metadata(filepath)?.len();
        let mut reader = BufReader::new(File::open(filepath)?);
        let parsed = Sf2Headers::parse(&mut reader)?;

        let filename = filepath
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self::from_headers(parsed, filepath.to_path_buf(), filename, filesize))
    }

    fn from_headers(sf2: Sf2Headers, filepath: PathBuf, filename: String, filesize: u64) -> Self {
        let mode = if sf2.string("product").to_lowercase().contains("midigurdy") {
            SoundFontMode::Midigurdy
        } else {
            SoundFontMode::Generic
        };

        let (base_notes, description) = match mode {
            SoundFontMode::Midigurdy => parse_basenote_commands(sf2.string("comments")),
            SoundFontMode::Generic => (Vec::new(), sf2.string("comments").to_string()),
        };

        let sounds = sf2
            .presets
            .iter()
            .map(|(bank, program, name)| {
                let (kind, base_note) = match mode {
                    SoundFontMode::Midigurdy => (
                        match bank {
                            0 => "melody",
                            1 => "drone",
                            2 => "trompette",
                            3 => "keynoise",
                            _ => "generic",
                        },
                        base_notes
                            .iter()
                            .find(|(b, p, _)| b == bank && p == program)
                            .map(|(_, _, n)| *n)
                            .unwrap_or(-1),
                    ),
                    SoundFontMode::Generic => ("generic", -1),
                };
                Sound {
                    bank: *bank,
                    program: *program,
                    name: name.clone(),
                    kind,
                    base_note,
                }
            })
            .collect();

        let mut font_name = sf2.string("font_name").to_string();
        if font_name.is_empty() {
            font_name = "Unnamed".to_string();
        }

        Self {
            id: filename.clone(),
            filename,
            filepath,
            filesize,
            name: font_name,
            copyright: sf2.string("copyright").to_string(),
            creation_date: sf2.string("creation_date").to_string(),
            author: sf2.string("designers").to_string(),
            tool: sf2.string("tool").to_string(),
            description,
            mode,
            sounds,
        }
    }

    /// All SoundFonts in the sound directory, ordered by name then id.
    pub fn load_all(sound_dir: &Path) -> Vec<SoundFont> {
        let mut fonts = Vec::new();
        let entries = match std::fs::read_dir(sound_dir) {
            Ok(entries) => entries,
            Err(_) => return fonts,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !has_soundfont_extension(&path) {
                continue;
            }
            match SoundFont::load(&path) {
                Ok(font) => fonts.push(font),
                Err(e) => tracing::warn!("skipping unreadable soundfont {:?}: {}", path, e),
            }
        }
        fonts.sort_by(|a, b| format!("{}{}", a.name, a.id).cmp(&format!("{}{}", b.name, b.id)));
        fonts
    }

    /// Weak id lookup: recomputed from disk on every call, never cached
    /// ownership.
    pub fn by_id(sound_dir: &Path, id: &str) -> Option<SoundFont> {
        let filename = sanitize_filename(id)?;
        SoundFont::load(&sound_dir.join(filename)).ok()
    }

    pub fn get_sound(&self, bank: i32, program: i32) -> Option<&Sound> {
        self.sounds
            .iter()
            .find(|s| s.bank == bank && s.program == program)
    }

    pub fn as_json(&self) -> Value {
        json!({
            "id": self.id,
            "filename": self.filename,
            "filesize": self.filesize,
            "mode": self.mode.as_str(),
            "name": self.name,
            "copyright": self.copyright,
            "creation_date": self.creation_date,
            "author": self.author,
            "tool": self.tool,
            "description": self.description,
            "sounds": self.sounds.iter().map(|s| json!({
                "id": format!("{}:{}:{}", self.id, s.bank, s.program),
                "bank": s.bank,
                "program": s.program,
                "name": s.name,
                "type": s.kind,
                "note": s.base_note,
            })).collect::<Vec<_>>(),
        })
    }
}

/// Strip path components from an id used as a filename. Returns None for
/// ids that resolve outside the sound directory.
pub fn sanitize_filename(id: &str) -> Option<String> {
    let name = Path::new(id).file_name()?.to_string_lossy().into_owned();
    if name.is_empty() || name.starts_with('.') {
        return None;
    }
    Some(name)
}

pub fn has_soundfont_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            ext == "sf2" || ext == "sf3"
        })
        .unwrap_or(false)
}

fn parse_basenote_commands(comments: &str) -> (Vec<(i32, i32, i32)>, String) {
    let re = Regex::new(r"basenote\s+(\d+)\s*:\s*(\d+)\s+(\d+)").unwrap();
    let mut base_notes = Vec::new();
    for caps in re.captures_iter(comments) {
        let parse = |idx: usize| caps.get(idx).unwrap().as_str().parse::<i32>();
        if let (Ok(bank), Ok(prog), Ok(note)) = (parse(1), parse(2), parse(3)) {
            base_notes.push((bank, prog, note));
        }
    }
    let description = re.replace_all(comments, "").trim().to_string();
    (base_notes, description)
}

/// RIFF header walk over INFO strings and phdr preset records.
pub struct Sf2Headers {
    list_size: u32,
    strings: std::collections::HashMap<&'static str, String>,
    /// (bank, program, name) sorted by bank then program.
    pub presets: Vec<(i32, i32, String)>,
}

impl Sf2Headers {
    /// Parse headers from a reader positioned at the start of the file.
    /// Used directly by the upload handler to validate streamed files.
    pub fn parse<R: Read + Seek>(reader: &mut R) -> Result<Self, SoundFontError> {
        let mut headers = Self {
            list_size: 0,
            strings: std::collections::HashMap::new(),
            presets: Vec::new(),
        };
        headers.parse_next(reader)?;
        Ok(headers)
    }

    fn string(&self, name: &str) -> &str {
        self.strings.get(name).map(String::as_str).unwrap_or("")
    }

    fn parse_next<R: Read + Seek>(&mut self, reader: &mut R) -> Result<(), SoundFontError> {
        let mut chunk_id = [0u8; 4];
        reader.read_exact(&mut chunk_id)?;

        match &chunk_id {
            b"RIFF" => {
                self.read_size(reader)?;
                self.parse_next(reader)
            }
            b"sfbk" => {
                // INFO list, sdta list, pdta list
                self.parse_next(reader)?;
                self.parse_next(reader)?;
                self.parse_next(reader)
            }
            b"LIST" => {
                self.list_size = self.read_size(reader)?;
                self.parse_next(reader)
            }
            b"INFO" | b"sdta" => {
                let end = reader.stream_position()? + self.list_size as u64 - 4;
                while reader.stream_position()? < end {
                    self.parse_next(reader)?;
                }
                Ok(())
            }
            b"pdta" => self.parse_next(reader),
            b"ifil" => {
                let size = self.read_size(reader)?;
                reader.seek(SeekFrom::Current(size as i64))?;
                Ok(())
            }
            b"phdr" => self.parse_phdr(reader),
            b"smpl" | b"sm24" => {
                let size = self.read_size(reader)?;
                reader.seek(SeekFrom::Current(size as i64))?;
                Ok(())
            }
            id => {
                if let Some(name) = info_string_key(id) {
                    let cap = if id == b"ICMT" { 65536 } else { 256 };
                    let size = self.read_size(reader)?.min(cap);
                    let mut buf = vec![0u8; size as usize];
                    reader.read_exact(&mut buf)?;
                    self.strings.insert(name, from_cstr(&buf));
                    Ok(())
                } else {
                    Err(SoundFontError::Format(format!(
                        "invalid chunk in file: {:?}",
                        String::from_utf8_lossy(id)
                    )))
                }
            }
        }
    }

    fn parse_phdr<R: Read + Seek>(&mut self, reader: &mut R) -> Result<(), SoundFontError> {
        let size = self.read_size(reader)?;
        let end = reader.stream_position()? + size as u64;
        while reader.stream_position()? < end {
            let mut record = [0u8; 38];
            reader.read_exact(&mut record)?;
            let name = from_cstr(&record[0..20]);
            let program = u16::from_le_bytes([record[20], record[21]]) as i32;
            let bank = u16::from_le_bytes([record[22], record[23]]) as i32;
            self.presets.push((bank, program, name));
        }
        // last record is the EOP marker
        if self.presets.pop().is_none() {
            return Err(SoundFontError::Format("missing phdr terminator".to_string()));
        }
        self.presets.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        Ok(())
    }

    fn read_size<R: Read>(&mut self, reader: &mut R) -> Result<u32, SoundFontError> {
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

fn info_string_key(chunk_id: &[u8; 4]) -> Option<&'static str> {
    Some(match chunk_id {
        b"irom" => "rom_name",
        b"iver" => "rom_version",
        b"ICRD" => "creation_date",
        b"IENG" => "designers",
        b"IPRD" => "product",
        b"ICOP" => "copyright",
        b"ICMT" => "comments",
        b"ISFT" => "tool",
        b"INAM" => "font_name",
        b"isng" => "sound_engine",
        _ => return None,
    })
}

fn from_cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Synthetic SoundFont construction for the test suites.
pub mod testdata {
    /// Build a minimal but structurally valid SoundFont: INFO strings,
    /// empty sample list and the given presets.
    pub fn build_sf2(
        name: &str,
        product: &str,
        comments: &str,
        presets: &[(u16, u16, &str)],
    ) -> Vec<u8> {
        fn chunk(id: &[u8; 4], payload: &[u8]) -> Vec<u8> {
            let mut out = Vec::new();
            out.extend_from_slice(id);
            out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            out.extend_from_slice(payload);
            out
        }

        fn cstr(text: &str, len: usize) -> Vec<u8> {
            let mut out = text.as_bytes().to_vec();
            out.truncate(len - 1);
            out.push(0);
            if out.len() % 2 == 1 {
                out.push(0);
            }
            out
        }

        let mut info = Vec::new();
        info.extend_from_slice(b"INFO");
        info.extend(chunk(b"ifil", &[2, 0, 1, 0]));
        info.extend(chunk(b"INAM", &cstr(name, 256)));
        info.extend(chunk(b"IPRD", &cstr(product, 256)));
        if !comments.is_empty() {
            info.extend(chunk(b"ICMT", &cstr(comments, 65536)));
        }

        let mut sdta = Vec::new();
        sdta.extend_from_slice(b"sdta");
        sdta.extend(chunk(b"smpl", &[]));

        let mut phdr = Vec::new();
        for (bank, program, pname) in presets {
            let mut record = [0u8; 38];
            let name_bytes = pname.as_bytes();
            record[..name_bytes.len().min(19)]
                .copy_from_slice(&name_bytes[..name_bytes.len().min(19)]);
            record[20..22].copy_from_slice(&program.to_le_bytes());
            record[22..24].copy_from_slice(&bank.to_le_bytes());
            phdr.extend_from_slice(&record);
        }
        // EOP marker
        phdr.extend_from_slice(&[0u8; 38]);

        let mut pdta = Vec::new();
        pdta.extend_from_slice(b"pdta");
        pdta.extend(chunk(b"phdr", &phdr));

        let mut sfbk = Vec::new();
        sfbk.extend_from_slice(b"sfbk");
        sfbk.extend(chunk(b"LIST", &info));
        sfbk.extend(chunk(b"LIST", &sdta));
        sfbk.extend(chunk(b"LIST", &pdta));

        chunk(b"RIFF", &sfbk)
    }
}

#[cfg(test)]
mod tests {
    use super::testdata::build_sf2;
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_headers() {
        let data = build_sf2(
            "Test Font",
            "Generic Synth",
            "",
            &[(0, 0, "Piano"), (0, 1, "Organ")],
        );
        let headers = Sf2Headers::parse(&mut Cursor::new(data)).unwrap();
        assert_eq!(headers.presets.len(), 2);
        assert_eq!(headers.presets[0], (0, 0, "Piano".to_string()));
        assert_eq!(headers.string("font_name"), "Test Font");
    }

    #[test]
    fn test_garbage_is_rejected() {
        let mut cursor = Cursor::new(b"this is not a soundfont at all".to_vec());
        assert!(Sf2Headers::parse(&mut cursor).is_err());
    }

    #[test]
    fn test_midigurdy_mode_and_basenotes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mg.sf2");
        let data = build_sf2(
            "Gurdy Font",
            "MidiGurdy Sound Set",
            "basenote 0:0 60 A fine font.",
            &[(0, 0, "Melody Nylon"), (1, 0, "Drone Low"), (2, 0, "Tromp")],
        );
        std::fs::write(&path, data).unwrap();

        let font = SoundFont::load(&path).unwrap();
        assert_eq!(font.mode, SoundFontMode::Midigurdy);
        assert_eq!(font.name, "Gurdy Font");
        assert_eq!(font.id, "mg.sf2");

        let melody = font.get_sound(0, 0).unwrap();
        assert_eq!(melody.kind, "melody");
        assert_eq!(melody.base_note, 60);

        let drone = font.get_sound(1, 0).unwrap();
        assert_eq!(drone.kind, "drone");
        assert_eq!(drone.base_note, -1);

        assert_eq!(font.description, "A fine font.");
    }

    #[test]
    fn test_generic_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gen.sf2");
        std::fs::write(&path, build_sf2("Gen", "SomeVendor", "notes", &[(0, 0, "Lead")])).unwrap();

        let font = SoundFont::load(&path).unwrap();
        assert_eq!(font.mode, SoundFontMode::Generic);
        let sound = font.get_sound(0, 0).unwrap();
        assert_eq!(sound.kind, "generic");
        assert_eq!(sound.base_note, -1);
        assert_eq!(font.description, "notes");
    }

    #[test]
    fn test_load_all_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("b.sf2"),
            build_sf2("Beta", "x", "", &[(0, 0, "P")]),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("a.sf2"),
            build_sf2("Alpha", "x", "", &[(0, 0, "P")]),
        )
        .unwrap();
        std::fs::write(dir.path().join("readme.txt"), "not a font").unwrap();

        let fonts = SoundFont::load_all(dir.path());
        assert_eq!(fonts.len(), 2);
        assert_eq!(fonts[0].name, "Alpha");
        assert_eq!(fonts[1].name, "Beta");
    }

    #[test]
    fn test_by_id_rejects_path_escape() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SoundFont::by_id(dir.path(), "../../../etc/passwd").is_none());
        assert!(SoundFont::by_id(dir.path(), "missing.sf2").is_none());
    }
}
