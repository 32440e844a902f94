//! Daily CSV export of the previous day's snapshots.
//!
//! Rows are streamed from the store in `(updated_time, station_id)` order,
//! written through a CSV writer straight into a base64 encoder, and the
//! encoded payload is committed to the archive. Only the encoded text is
//! ever held in memory.

pub mod archive;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::write::EncoderStringWriter;
use chrono::{DateTime, Days, NaiveDate, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use futures::{Stream, TryStreamExt};
use thiserror::Error;
use tracing::Instrument;

use crate::storage::{
    Database, EntityKind, Snapshot, StationInformationSnapshot, StationStatusSnapshot, StoreError,
};
use archive::{ArchiveClient, ArchiveError};

#[derive(Debug, Error)]
pub enum ExportError {
    /// The day has no representable local midnight in the publication timezone
    #[error("No export window for {0}")]
    Window(NaiveDate),
    #[error("Failed to read snapshots: {0}")]
    Store(#[from] StoreError),
    #[error("CSV serialization failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("CSV encoding failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Inclusive `[start, end]` unix-second bounds of one local day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportWindow {
    pub date: NaiveDate,
    pub start: i64,
    pub end: i64,
}

impl ExportWindow {
    /// Window covering `date` in `tz`: from local midnight up to one second
    /// before the next local midnight, so 23h and 25h DST days are exact.
    pub fn for_day(date: NaiveDate, tz: Tz) -> Result<Self, ExportError> {
        let next = date
            .checked_add_days(Days::new(1))
            .ok_or(ExportError::Window(date))?;
        let start = local_midnight(date, tz).ok_or(ExportError::Window(date))?;
        let next_start = local_midnight(next, tz).ok_or(ExportError::Window(date))?;

        Ok(Self {
            date,
            start,
            end: next_start - 1,
        })
    }

    /// Window for the day before `now`, as seen in `tz`.
    pub fn yesterday(now: DateTime<Utc>, tz: Tz) -> Result<Self, ExportError> {
        let today = now.with_timezone(&tz).date_naive();
        let yesterday = today.pred_opt().ok_or(ExportError::Window(today))?;
        Self::for_day(yesterday, tz)
    }

    /// Archive path of this day's file for `kind`
    pub fn file_path(&self, kind: EntityKind) -> String {
        format!(
            "dataset/{}/{}.csv",
            kind.export_dir(),
            self.date.format("%d-%m-%Y")
        )
    }
}

/// First instant of `date` in `tz`. Where a DST jump skips 00:00 the day
/// starts at the first local minute that exists.
fn local_midnight(date: NaiveDate, tz: Tz) -> Option<i64> {
    let midnight = date.and_hms_opt(0, 0, 0)?;
    (0..24 * 60)
        .map(|minute| midnight + TimeDelta::minutes(minute))
        .find_map(|local| tz.from_local_datetime(&local).earliest())
        .map(|dt| dt.timestamp())
}

/// A base64-encoded CSV document.
#[derive(Debug)]
pub struct EncodedCsv {
    pub content: String,
    pub rows: usize,
}

/// Serialize a row stream as CSV with a header row, encoding to base64 as
/// rows arrive.
///
/// The header is the snapshot's field names in declaration order and is
/// written even when the stream is empty.
pub async fn encode_csv<S, R>(mut rows: R) -> Result<EncodedCsv, ExportError>
where
    S: Snapshot,
    R: Stream<Item = Result<S, StoreError>> + Unpin,
{
    let encoder = EncoderStringWriter::new(&BASE64);
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(encoder);

    writer.write_record(S::COLUMNS.split(',').map(str::trim))?;

    let mut count = 0usize;
    while let Some(row) = rows.try_next().await? {
        writer.serialize(&row)?;
        count += 1;
    }

    writer.flush()?;
    let encoder = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(e.error().kind(), e.error().to_string()))?;

    Ok(EncodedCsv {
        content: encoder.into_inner(),
        rows: count,
    })
}

/// Result of exporting one entity.
#[derive(Debug)]
pub struct EntityExport {
    pub path: String,
    pub rows: usize,
}

/// Per-entity outcomes of one export run. Entities fail independently.
#[derive(Debug)]
pub struct ExportReport {
    pub window: ExportWindow,
    pub information: Result<EntityExport, ExportError>,
    pub status: Result<EntityExport, ExportError>,
}

impl ExportReport {
    pub fn is_success(&self) -> bool {
        self.information.is_ok() && self.status.is_ok()
    }
}

/// Where exported files are committed
#[derive(Debug, Clone)]
pub struct ExportTarget {
    pub owner: String,
    pub repo: String,
}

/// Exports one day of snapshots per entity to the archive.
pub struct Exporter<A> {
    db: Database,
    archive: A,
    target: ExportTarget,
    timezone: Tz,
}

impl<A: ArchiveClient> Exporter<A> {
    pub fn new(db: Database, archive: A, target: ExportTarget, timezone: Tz) -> Self {
        Self {
            db,
            archive,
            target,
            timezone,
        }
    }

    /// Export the day before now in the publication timezone.
    pub async fn export_yesterday(&self) -> Result<ExportReport, ExportError> {
        let window = ExportWindow::yesterday(Utc::now(), self.timezone)?;
        Ok(self.export_window(window).await)
    }

    /// Export an arbitrary day.
    pub async fn export_day(&self, date: NaiveDate) -> Result<ExportReport, ExportError> {
        let window = ExportWindow::for_day(date, self.timezone)?;
        Ok(self.export_window(window).await)
    }

    async fn export_window(&self, window: ExportWindow) -> ExportReport {
        let span = tracing::info_span!("export", date = %window.date);
        async {
            tracing::info!(start = window.start, end = window.end, "Starting daily export");

            // Sequential so only one encoded file is in memory at a time
            let information = self.export_entity::<StationInformationSnapshot>(&window).await;
            let status = self.export_entity::<StationStatusSnapshot>(&window).await;

            let report = ExportReport {
                window,
                information,
                status,
            };
            if report.is_success() {
                tracing::info!("Data successfully sent to archive");
            }
            report
        }
        .instrument(span)
        .await
    }

    async fn export_entity<S: Snapshot>(
        &self,
        window: &ExportWindow,
    ) -> Result<EntityExport, ExportError> {
        let path = window.file_path(S::KIND);
        let result = self.upload::<S>(window, &path).await;

        match &result {
            Ok(rows) => {
                tracing::info!(entity = %S::KIND, path = %path, rows = rows, "Exported snapshots");
            }
            Err(e) => {
                tracing::error!(entity = %S::KIND, path = %path, error = %e, "Export failed");
            }
        }

        result.map(|rows| EntityExport { path, rows })
    }

    async fn upload<S: Snapshot>(
        &self,
        window: &ExportWindow,
        path: &str,
    ) -> Result<usize, ExportError> {
        let rows = self.db.query_window::<S>(window.start, window.end);
        let encoded = encode_csv(rows).await?;
        let message = format!("chore: add {}", path);

        self.archive
            .put_file(
                &self.target.owner,
                &self.target.repo,
                path,
                &message,
                encoded.content,
            )
            .await?;

        Ok(encoded.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use futures::stream;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn status(updated_time: i64, station_id: &str) -> StationStatusSnapshot {
        StationStatusSnapshot {
            updated_time,
            station_id: station_id.to_string(),
            num_bikes_available: 4,
            num_bikes_disabled: 1,
            num_docks_available: 7,
            is_installed: 1,
            is_renting: 1,
            is_returning: 0,
            last_reported: updated_time - 3,
        }
    }

    fn decode(encoded: &EncodedCsv) -> String {
        String::from_utf8(BASE64.decode(&encoded.content).unwrap()).unwrap()
    }

    #[test]
    fn test_window_utc_day() {
        let window = ExportWindow::for_day(date(2024, 1, 2), chrono_tz::UTC).unwrap();
        assert_eq!(window.start, 1704153600);
        assert_eq!(window.end, 1704153600 + 86399);
    }

    #[test]
    fn test_window_paris_winter_day() {
        let window = ExportWindow::for_day(date(2024, 1, 2), chrono_tz::Europe::Paris).unwrap();
        // UTC+1 in winter
        assert_eq!(window.start, 1704153600 - 3600);
        assert_eq!(window.end - window.start, 86399);
    }

    #[test]
    fn test_window_spans_dst_transitions() {
        let spring = ExportWindow::for_day(date(2024, 3, 31), chrono_tz::Europe::Paris).unwrap();
        assert_eq!(spring.end - spring.start + 1, 23 * 3600);

        let autumn = ExportWindow::for_day(date(2024, 10, 27), chrono_tz::Europe::Paris).unwrap();
        assert_eq!(autumn.end - autumn.start + 1, 25 * 3600);
    }

    #[test]
    fn test_window_when_dst_skips_midnight() {
        // Santiago jumps from 00:00 -04 to 01:00 -03 on 2024-09-08
        let tz = chrono_tz::America::Santiago;
        let gap_start = Utc.with_ymd_and_hms(2024, 9, 8, 4, 0, 0).unwrap().timestamp();

        let before = ExportWindow::for_day(date(2024, 9, 7), tz).unwrap();
        assert_eq!(
            before.start,
            Utc.with_ymd_and_hms(2024, 9, 7, 4, 0, 0).unwrap().timestamp()
        );
        assert_eq!(before.end, gap_start - 1);

        let gap_day = ExportWindow::for_day(date(2024, 9, 8), tz).unwrap();
        assert_eq!(gap_day.start, gap_start);
        assert_eq!(gap_day.end - gap_day.start + 1, 23 * 3600);
    }

    #[test]
    fn test_yesterday_uses_publication_timezone() {
        // 23:30 UTC on Jan 1st is already Jan 2nd in Paris
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 23, 30, 0).unwrap();

        let paris = ExportWindow::yesterday(now, chrono_tz::Europe::Paris).unwrap();
        let utc = ExportWindow::yesterday(now, chrono_tz::UTC).unwrap();

        assert_eq!(paris.date, date(2024, 1, 1));
        assert_eq!(utc.date, date(2023, 12, 31));
    }

    #[test]
    fn test_file_paths() {
        let window = ExportWindow::for_day(date(2024, 3, 5), chrono_tz::UTC).unwrap();
        assert_eq!(
            window.file_path(EntityKind::StationInformation),
            "dataset/stations_information/05-03-2024.csv"
        );
        assert_eq!(
            window.file_path(EntityKind::StationStatus),
            "dataset/stations_statuses/05-03-2024.csv"
        );
    }

    #[tokio::test]
    async fn test_encode_csv_header_and_rows() {
        let rows = stream::iter(vec![Ok(status(1000, "5")), Ok(status(1001, "6"))]);

        let encoded = encode_csv::<StationStatusSnapshot, _>(rows).await.unwrap();

        assert_eq!(encoded.rows, 2);
        assert_eq!(
            decode(&encoded),
            "updated_time,station_id,num_bikes_available,num_bikes_disabled,\
             num_docks_available,is_installed,is_renting,is_returning,last_reported\n\
             1000,5,4,1,7,1,1,0,997\n\
             1001,6,4,1,7,1,1,0,998\n"
        );
    }

    #[tokio::test]
    async fn test_encode_csv_empty_day_still_has_header() {
        let rows = stream::iter(Vec::<Result<StationInformationSnapshot, StoreError>>::new());

        let encoded = encode_csv(rows).await.unwrap();

        assert_eq!(encoded.rows, 0);
        assert_eq!(
            decode(&encoded),
            "updated_time,station_id,name,lat,lon,capacity\n"
        );
    }

    #[tokio::test]
    async fn test_encode_csv_quotes_names_with_commas() {
        let row = StationInformationSnapshot {
            updated_time: 1,
            station_id: "1".to_string(),
            name: "Place de la Comédie, Nord".to_string(),
            lat: 43.6,
            lon: 3.88,
            capacity: 20,
        };

        let encoded = encode_csv(stream::iter(vec![Ok(row.clone())])).await.unwrap();

        let text = decode(&encoded);
        assert!(text.contains("\"Place de la Comédie, Nord\""));
        let mut reader = csv::Reader::from_reader(text.as_bytes());
        let parsed: Vec<StationInformationSnapshot> =
            reader.deserialize().collect::<Result<_, _>>().unwrap();
        assert_eq!(parsed, vec![row]);
    }

    #[tokio::test]
    async fn test_encode_csv_propagates_store_error() {
        let rows = stream::iter(vec![
            Ok(status(1000, "5")),
            Err(StoreError::Migration("boom".to_string())),
        ]);

        let result = encode_csv::<StationStatusSnapshot, _>(rows).await;
        assert!(matches!(result, Err(ExportError::Store(_))));
    }

    proptest! {
        #[test]
        fn prop_csv_round_trip(
            entries in prop::collection::vec(
                (0i64..2_000_000_000, "[a-zA-Z0-9 ,\"'-]{0,12}", 0i64..200, -90.0f64..90.0, -180.0f64..180.0),
                0..20,
            )
        ) {
            let records: Vec<StationInformationSnapshot> = entries
                .into_iter()
                .enumerate()
                .map(|(i, (t, name, capacity, lat, lon))| StationInformationSnapshot {
                    updated_time: t,
                    station_id: format!("{i}"),
                    name,
                    lat,
                    lon,
                    capacity,
                })
                .collect();

            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let encoded = rt
                .block_on(encode_csv(stream::iter(records.clone().into_iter().map(Ok))))
                .unwrap();

            let text = decode(&encoded);
            let mut reader = csv::Reader::from_reader(text.as_bytes());
            let parsed: Vec<StationInformationSnapshot> =
                reader.deserialize().collect::<Result<_, _>>().unwrap();
            prop_assert_eq!(parsed, records);
        }
    }
}
