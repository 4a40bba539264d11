//! Streaming JSON serialization straight into the connection.
//!
//! Nothing is rendered into an intermediate string; scalars and escapes go to
//! the writer as they are produced, so memory use is bounded by the writer's
//! buffer plus one frame per nesting level.

use std::{io, slice};

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use webnode_common::{UnsupportedValue, Value};

#[derive(Debug, Error)]
pub enum JsonError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Unsupported(#[from] UnsupportedValue),
}

enum Frame<'a> {
    Map {
        entries: slice::Iter<'a, (String, Value)>,
        first: bool,
    },
    List {
        items: slice::Iter<'a, Value>,
        first: bool,
    },
}

enum Step<'a> {
    Entry {
        separator: bool,
        key: Option<&'a str>,
        value: &'a Value,
    },
    Close(&'static [u8]),
    Done,
}

pub async fn write_value<W>(value: &Value, out: &mut W) -> Result<(), JsonError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut stack: Vec<Frame<'_>> = Vec::new();
    let mut next = Some(value);

    loop {
        if let Some(value) = next.take() {
            match value {
                Value::Null => out.write_all(b"null").await?,
                Value::Bool(true) => out.write_all(b"true").await?,
                Value::Bool(false) => out.write_all(b"false").await?,
                Value::Int(number) => out.write_all(number.to_string().as_bytes()).await?,
                Value::Float(number) => {
                    if !number.is_finite() {
                        return Err(UnsupportedValue(format!("non-finite float {number}")).into());
                    }
                    out.write_all(format!("{number:?}").as_bytes()).await?;
                }
                Value::Text(text) => write_string(out, text.chars()).await?,
                Value::Bytes(bytes) => {
                    write_string(out, bytes.iter().map(|&byte| char::from(byte))).await?
                }
                Value::Map(entries) => {
                    out.write_all(b"{").await?;
                    stack.push(Frame::Map {
                        entries: entries.iter(),
                        first: true,
                    });
                }
                Value::List(items) => {
                    out.write_all(b"[").await?;
                    stack.push(Frame::List {
                        items: items.iter(),
                        first: true,
                    });
                }
            }
        }

        let step = match stack.last_mut() {
            None => Step::Done,
            Some(Frame::Map { entries, first }) => match entries.next() {
                Some((key, value)) => {
                    let separator = !std::mem::replace(first, false);
                    Step::Entry {
                        separator,
                        key: Some(key),
                        value,
                    }
                }
                None => Step::Close(b"}"),
            },
            Some(Frame::List { items, first }) => match items.next() {
                Some(value) => {
                    let separator = !std::mem::replace(first, false);
                    Step::Entry {
                        separator,
                        key: None,
                        value,
                    }
                }
                None => Step::Close(b"]"),
            },
        };

        match step {
            Step::Done => return Ok(()),
            Step::Close(bracket) => {
                stack.pop();
                out.write_all(bracket).await?;
            }
            Step::Entry {
                separator,
                key,
                value,
            } => {
                if separator {
                    out.write_all(b",").await?;
                }
                if let Some(key) = key {
                    write_string(out, key.chars()).await?;
                    out.write_all(b":").await?;
                }
                next = Some(value);
            }
        }
    }
}

async fn write_string<W, I>(out: &mut W, chars: I) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    I: Iterator<Item = char>,
{
    out.write_all(b"\"").await?;
    let mut utf8 = [0u8; 4];
    for ch in chars {
        match ch {
            '"' => out.write_all(b"\\\"").await?,
            '\\' => out.write_all(b"\\\\").await?,
            '\n' => out.write_all(b"\\n").await?,
            '\r' => out.write_all(b"\\r").await?,
            '\t' => out.write_all(b"\\t").await?,
            ch if u32::from(ch) < 0x20 => {
                out.write_all(format!("\\u{:04x}", u32::from(ch)).as_bytes())
                    .await?
            }
            ch => out.write_all(ch.encode_utf8(&mut utf8).as_bytes()).await?,
        }
    }
    out.write_all(b"\"").await
}
