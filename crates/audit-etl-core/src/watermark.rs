use crate::store::{StoreError, TargetStore};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::fmt;
use tracing::info;

/// Lower bound used when the target holds no rows yet, so a first run takes full history.
pub fn watermark_floor() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2020, 1, 1)
        .unwrap_or_default()
        .and_time(NaiveTime::MIN)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    pub since: NaiveDateTime,
    pub from_floor: bool,
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.since)?;
        if self.from_floor {
            f.write_str(" (floor)")?;
        }
        Ok(())
    }
}

pub fn read_watermark(target: &mut dyn TargetStore) -> Result<Watermark, StoreError> {
    let watermark = match target.max_event_time()? {
        Some(since) => Watermark {
            since,
            from_floor: false,
        },
        None => {
            info!(event = "target_empty", "target table is empty, extracting full history");
            Watermark {
                since: watermark_floor(),
                from_floor: true,
            }
        }
    };
    info!(event = "watermark", since = %watermark.since, from_floor = watermark.from_floor);
    Ok(watermark)
}
