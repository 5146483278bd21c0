use anyhow::Result;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::model::{Chunk, Window};
use crate::reader::WorkbookHandle;

/// Rows are framed in batches of this size.
const ROW_BATCH: usize = 100;

/// One framed streaming record; the transport writes one per line and
/// flushes after each.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Metadata { data: Value },
    SheetStart { data: Value },
    Rows { data: Value },
    SheetComplete { sheet_index: usize, sheet_name: String },
    WindowStart { data: Value },
    WindowData { data: Value },
    WindowComplete,
    Complete { chunk_id: String },
    Error { error: String },
}

pub async fn write_event<W: AsyncWrite + Unpin>(writer: &mut W, event: &StreamEvent) -> Result<()> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Streams one chunk's sheets as a framed event sequence.
pub struct ChunkStreamer<'a> {
    handle: &'a dyn WorkbookHandle,
    chunk: &'a Chunk,
}

impl<'a> ChunkStreamer<'a> {
    pub fn new(handle: &'a dyn WorkbookHandle, chunk: &'a Chunk) -> Self {
        Self { handle, chunk }
    }

    pub async fn stream<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let sheet_names = self.handle.sheet_list();

        write_event(
            writer,
            &StreamEvent::Metadata {
                data: json!({
                    "chunk_id": self.chunk.chunk_id,
                    "sheets_range": self.chunk.sheets_range,
                    "streaming": true,
                }),
            },
        )
        .await?;

        let [lo, hi] = self.chunk.sheets_range;
        for sheet_index in lo..(hi + 1).min(sheet_names.len()) {
            let sheet_name = &sheet_names[sheet_index];
            if let Err(error) = self.stream_sheet(writer, sheet_name, sheet_index).await {
                // The consumer sees the fault in-band before the stream ends.
                write_event(
                    writer,
                    &StreamEvent::Error {
                        error: error.to_string(),
                    },
                )
                .await?;
                return Err(error);
            }
        }

        write_event(
            writer,
            &StreamEvent::Complete {
                chunk_id: self.chunk.chunk_id.clone(),
            },
        )
        .await
    }

    async fn stream_sheet<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        sheet_name: &str,
        sheet_index: usize,
    ) -> Result<()> {
        let rows = self.handle.rows(sheet_name)?;

        write_event(
            writer,
            &StreamEvent::SheetStart {
                data: json!({
                    "sheet_index": sheet_index,
                    "sheet_name": sheet_name,
                    "total_rows": rows.len(),
                }),
            },
        )
        .await?;

        for (batch_index, batch) in rows.chunks(ROW_BATCH).enumerate() {
            write_event(
                writer,
                &StreamEvent::Rows {
                    data: json!({
                        "sheet_index": sheet_index,
                        "sheet_name": sheet_name,
                        "start_row": batch_index * ROW_BATCH,
                        "rows": batch,
                    }),
                },
            )
            .await?;
        }

        write_event(
            writer,
            &StreamEvent::SheetComplete {
                sheet_index,
                sheet_name: sheet_name.to_string(),
            },
        )
        .await
    }
}

/// Rectangular reads over one sheet.
pub struct WindowedReader<'a> {
    handle: &'a dyn WorkbookHandle,
    sheet_name: &'a str,
    window: Window,
}

impl<'a> WindowedReader<'a> {
    pub fn new(handle: &'a dyn WorkbookHandle, sheet_name: &'a str, window: Window) -> Self {
        Self {
            handle,
            sheet_name,
            window,
        }
    }

    /// Rows clipped to the window rectangle (0-based, end-inclusive).
    pub fn read_window(&self) -> Result<Vec<Vec<String>>> {
        let rows = self.handle.rows(self.sheet_name)?;
        let Window {
            start_row,
            end_row,
            start_col,
            end_col,
        } = self.window;

        let mut out = Vec::new();
        for row in rows
            .iter()
            .skip(start_row as usize)
            .take((end_row as usize).saturating_sub(start_row as usize) + 1)
        {
            let cells: Vec<String> = row
                .iter()
                .skip(start_col as usize)
                .take((end_col as usize).saturating_sub(start_col as usize) + 1)
                .cloned()
                .collect();
            out.push(cells);
        }
        Ok(out)
    }

    pub async fn stream<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let window_data = self.read_window()?;

        write_event(
            writer,
            &StreamEvent::WindowStart {
                data: json!({
                    "sheet_name": self.sheet_name,
                    "window": self.window,
                    "rows": window_data.len(),
                }),
            },
        )
        .await?;

        for (batch_index, batch) in window_data.chunks(ROW_BATCH / 2).enumerate() {
            write_event(
                writer,
                &StreamEvent::WindowData {
                    data: json!({
                        "start_row": self.window.start_row as usize + batch_index * (ROW_BATCH / 2),
                        "rows": batch,
                    }),
                },
            )
            .await?;
        }

        write_event(writer, &StreamEvent::WindowComplete).await
    }
}
