//! DA/DT/TM parsing and rewriting for `date-shift` and `date-floor`.

use chrono::{Duration, NaiveDate};
use dicom::core::VR;

#[derive(Debug, thiserror::Error)]
#[error("{value:?} is not a valid {vr:?} value")]
pub struct DateError {
    pub vr: VR,
    pub value: String,
}

pub fn parse_da(value: &str) -> Option<NaiveDate> {
    let digits = value.trim();
    if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(digits, "%Y%m%d").ok()
}

fn format_da(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Shift a DA/DT value by whole days, re-emitting in the same VR. TM values
/// carry no date component, so a whole-day shift leaves them unchanged.
pub fn shift(vr: VR, value: &str, days: i64) -> Result<String, DateError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    let error = || DateError {
        vr,
        value: value.to_string(),
    };
    match vr {
        VR::DA => {
            let date = parse_da(trimmed).ok_or_else(error)?;
            Ok(format_da(date + Duration::days(days)))
        }
        VR::DT => {
            if trimmed.len() < 8 {
                return Err(error());
            }
            let (date_part, rest) = trimmed.split_at(8);
            let date = parse_da(date_part).ok_or_else(error)?;
            Ok(format!("{}{rest}", format_da(date + Duration::days(days))))
        }
        VR::TM => Ok(trimmed.to_string()),
        _ => Err(error()),
    }
}

/// Truncate a DT/TM value to the start of its day.
pub fn floor(vr: VR, value: &str) -> Result<String, DateError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    let error = || DateError {
        vr,
        value: value.to_string(),
    };
    match vr {
        VR::DT => {
            if trimmed.len() < 8 {
                return Err(error());
            }
            let date_part = &trimmed[..8];
            parse_da(date_part).ok_or_else(error)?;
            Ok(format!("{date_part}000000"))
        }
        VR::TM => Ok("000000".to_string()),
        _ => Err(error()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn da_values_shift_by_whole_days() {
        assert_eq!(shift(VR::DA, "20230110", -9).unwrap(), "20230101");
        assert_eq!(shift(VR::DA, "20230101", -1).unwrap(), "20221231");
        assert_eq!(shift(VR::DA, "20230110", 0).unwrap(), "20230110");
    }

    #[test]
    fn dt_values_keep_their_time_component() {
        assert_eq!(
            shift(VR::DT, "20230110123045.123456", -9).unwrap(),
            "20230101123045.123456"
        );
        assert_eq!(
            shift(VR::DT, "20230110123045+0100", -10).unwrap(),
            "20221231123045+0100"
        );
    }

    #[test]
    fn tm_values_are_untouched_by_day_shifts() {
        assert_eq!(shift(VR::TM, "123045", -30).unwrap(), "123045");
    }

    #[test]
    fn floors_truncate_to_start_of_day() {
        assert_eq!(floor(VR::DT, "20230110123045").unwrap(), "20230110000000");
        assert_eq!(floor(VR::TM, "123045.99").unwrap(), "000000");
    }

    #[test]
    fn malformed_values_error() {
        assert!(shift(VR::DA, "2023011", -1).is_err());
        assert!(shift(VR::DA, "20231301", -1).is_err());
        assert!(floor(VR::DT, "2023").is_err());
    }

    #[test]
    fn empty_values_pass_through() {
        assert_eq!(shift(VR::DA, "", -5).unwrap(), "");
        assert_eq!(floor(VR::TM, "").unwrap(), "");
    }
}
