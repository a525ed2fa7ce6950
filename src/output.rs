use crate::error::Error;
use log::info;
use rusqlite::{params, Connection};
use serde_json::{json, Value};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// Where replicated documents and attachments land. The replicator depends
/// only on this capability.
pub trait Datastore: Send {
    /// Points the sink at a named database before the pass starts.
    fn bind(&mut self, name: &str) -> Result<(), Error>;

    fn write(&mut self, doc_id: &str, document: &Value) -> Result<(), Error>;

    fn write_attachment(
        &mut self,
        doc_id: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<(), Error>;
}

fn document_text(document: &Value) -> Result<String, Error> {
    match document {
        Value::String(text) => Ok(text.clone()),
        other => Ok(serde_json::to_string(other)?),
    }
}

/// SQLite sink: one `<dir>/<name>.db` file with a documents table and an
/// attachments table.
pub struct LocalDb {
    directory: PathBuf,
    connection: Option<Connection>,
}

impl LocalDb {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, Error> {
        let directory = directory.into();
        if !directory.is_dir() {
            return Err(Error::Output(format!(
                "directory {} is not writable",
                directory.display()
            )));
        }
        Ok(LocalDb {
            directory,
            connection: None,
        })
    }

    fn connection(&mut self) -> Result<&Connection, Error> {
        self.connection
            .as_ref()
            .ok_or_else(|| Error::Output("datastore is not bound to a database".to_string()))
    }
}

impl Datastore for LocalDb {
    fn bind(&mut self, name: &str) -> Result<(), Error> {
        let db_file = self.directory.join(format!("{}.db", name));
        let connection = Connection::open(&db_file)
            .map_err(|err| Error::Output(format!("can not open {}: {}", db_file.display(), err)))?;
        connection
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS documents(
                     doc_id TEXT PRIMARY KEY ON CONFLICT REPLACE,
                     document TEXT
                 );
                 CREATE TABLE IF NOT EXISTS attachments(
                     doc_id TEXT PRIMARY KEY ON CONFLICT REPLACE,
                     content_type TEXT,
                     data BLOB
                 );",
            )
            .map_err(|err| Error::Output(format!("can not create tables: {}", err)))?;
        self.connection = Some(connection);
        Ok(())
    }

    fn write(&mut self, doc_id: &str, document: &Value) -> Result<(), Error> {
        let text = document_text(document)?;
        self.connection()?
            .execute(
                "INSERT OR REPLACE INTO documents VALUES (?1, ?2)",
                params![doc_id, text],
            )
            .map_err(|err| Error::Output(format!("can not write document: {}", err)))?;
        Ok(())
    }

    fn write_attachment(
        &mut self,
        doc_id: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<(), Error> {
        self.connection()?
            .execute(
                "INSERT OR REPLACE INTO attachments VALUES (?1, ?2, ?3)",
                params![doc_id, content_type, data],
            )
            .map_err(|err| Error::Output(format!("can not write attachment: {}", err)))?;
        Ok(())
    }
}

/// JSON-lines sink: one `{doc_id: body}` object per line, attachments as
/// sibling files named after the sanitized document id.
pub struct LocalFile {
    directory: PathBuf,
    jsonl_file: Option<PathBuf>,
}

impl LocalFile {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, Error> {
        let directory = directory.into();
        if !directory.is_dir() {
            return Err(Error::Output(format!(
                "directory {} is not writable",
                directory.display()
            )));
        }
        Ok(LocalFile {
            directory,
            jsonl_file: None,
        })
    }
}

impl Datastore for LocalFile {
    fn bind(&mut self, name: &str) -> Result<(), Error> {
        let jsonl_file = self.directory.join(format!("{}.jsonl", name));
        File::create(&jsonl_file).map_err(|err| {
            Error::Output(format!("can not open file {}: {}", jsonl_file.display(), err))
        })?;
        self.jsonl_file = Some(jsonl_file);
        Ok(())
    }

    fn write(&mut self, doc_id: &str, document: &Value) -> Result<(), Error> {
        let jsonl_file = self
            .jsonl_file
            .as_ref()
            .ok_or_else(|| Error::Output("datastore is not bound to a database".to_string()))?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(jsonl_file)
            .map_err(|err| Error::Output(format!("can not write to file: {}", err)))?;
        let line = json!({ doc_id: document });
        writeln!(file, "{}", line)
            .map_err(|err| Error::Output(format!("can not write to file: {}", err)))?;
        Ok(())
    }

    fn write_attachment(
        &mut self,
        doc_id: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<(), Error> {
        let filename = self.directory.join(format!(
            "{}{}",
            sanitize_doc_id(doc_id),
            extension_for(content_type)
        ));
        std::fs::write(&filename, data)
            .map_err(|err| Error::Output(format!("can not write to file: {}", err)))?;
        Ok(())
    }
}

/// Console sink, mostly for ad-hoc inspection.
#[derive(Debug, Default)]
pub struct ScreenOutput {
    database: Option<String>,
}

impl ScreenOutput {
    pub fn new() -> Self {
        ScreenOutput::default()
    }
}

impl Datastore for ScreenOutput {
    fn bind(&mut self, name: &str) -> Result<(), Error> {
        self.database = Some(name.to_string());
        Ok(())
    }

    fn write(&mut self, doc_id: &str, document: &Value) -> Result<(), Error> {
        println!("{}", json!({ doc_id: document }));
        Ok(())
    }

    fn write_attachment(
        &mut self,
        doc_id: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<(), Error> {
        info!(
            "attachment from document {} of type {} length {}",
            doc_id,
            content_type,
            data.len()
        );
        println!(
            "Attachment from document {} of type {} length {}",
            doc_id,
            content_type,
            data.len()
        );
        Ok(())
    }
}

// Document ids can carry characters that are hostile to filesystems
pub(crate) fn sanitize_doc_id(doc_id: &str) -> String {
    doc_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_whitespace()
                || matches!(
                    c,
                    '#' | '%' | '&' | '{' | '}' | '<' | '>' | '*' | '?' | '$' | '!' | ':' | '@'
                        | '+' | '|' | '=' | '\\' | '/' | '\'' | '`' | '"'
                )
            {
                '_'
            } else {
                c
            }
        })
        .collect::<String>()
        .to_lowercase()
}

pub(crate) fn extension_for(content_type: &str) -> &'static str {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim();
    match essence {
        "image/png" => ".png",
        "image/jpeg" => ".jpg",
        "image/gif" => ".gif",
        "image/svg+xml" => ".svg",
        "text/plain" => ".txt",
        "text/html" => ".html",
        "application/json" => ".json",
        "application/pdf" => ".pdf",
        _ => ".bin",
    }
}
