use crate::db;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const DISPATCH_KEY: &str = "setup.dispatch";
pub const LETTERS_KEY: &str = "setup.letters";

pub const DEFAULT_LETTER_TEMPLATE: &str = "SURAT PERINGATAN {{letter_kind}}
{{school_name}}

Dengan ini kami memberitahukan bahwa siswa berikut:
  Nama  : {{student_name}}
  NISN  : {{nisn}}
  Kelas : {{class_name}}

telah mencapai {{deficit}} poin pelanggaran pada tahun ajaran {{academic_year}}
(batas {{letter_kind}}: {{threshold}} poin, total poin saat ini {{total_points}}).

Orang tua/wali dimohon hadir untuk pembinaan bersama wali kelas dan BK.

{{issued_on}}
{{signatory}}
";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    pub outbox_dir: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            outbox_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LetterConfig {
    pub school_name: String,
    pub signatory: String,
    pub default_template: String,
}

impl Default for LetterConfig {
    fn default() -> Self {
        Self {
            school_name: String::new(),
            signatory: "Kepala Sekolah".to_string(),
            default_template: DEFAULT_LETTER_TEMPLATE.to_string(),
        }
    }
}

fn load_section<T>(conn: &Connection, key: &str) -> anyhow::Result<T>
where
    T: DeserializeOwned + Default,
{
    match db::settings_get_json(conn, key)? {
        Some(v) => Ok(serde_json::from_value(v)?),
        None => Ok(T::default()),
    }
}

pub fn dispatch_config(conn: &Connection) -> anyhow::Result<DispatchConfig> {
    load_section(conn, DISPATCH_KEY)
}

pub fn letter_config(conn: &Connection) -> anyhow::Result<LetterConfig> {
    load_section(conn, LETTERS_KEY)
}
