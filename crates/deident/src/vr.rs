//! VR-aware value handling: compatibility checks for tag operations at
//! config-load time, and typed value construction at rewrite time.

use dicom::core::{PrimitiveValue, VR};
use models::TagOperation;

#[derive(Debug, thiserror::Error)]
pub enum VrError {
    #[error("value {value:?} is not valid for VR {vr:?}")]
    Incompatible { vr: VR, value: String },
    #[error("operation {op} cannot apply to VR {vr:?}")]
    OperationMismatch { op: &'static str, vr: VR },
}

pub fn is_date_kind(vr: VR) -> bool {
    matches!(vr, VR::DA | VR::DT | VR::TM)
}

pub fn is_numeric(vr: VR) -> bool {
    matches!(
        vr,
        VR::DS | VR::IS | VR::FL | VR::FD | VR::SL | VR::SS | VR::SV | VR::UL | VR::US | VR::UV
    )
}

pub fn is_string_like(vr: VR) -> bool {
    matches!(
        vr,
        VR::AE
            | VR::AS
            | VR::CS
            | VR::DA
            | VR::DS
            | VR::DT
            | VR::IS
            | VR::LO
            | VR::LT
            | VR::PN
            | VR::SH
            | VR::ST
            | VR::TM
            | VR::UC
            | VR::UI
            | VR::UR
            | VR::UT
    )
}

/// Maximum encoded value length for length-bounded VRs.
pub fn max_len(vr: VR) -> Option<usize> {
    match vr {
        VR::AE => Some(16),
        VR::AS => Some(4),
        VR::CS => Some(16),
        VR::DA => Some(8),
        VR::DS => Some(16),
        VR::DT => Some(26),
        VR::IS => Some(12),
        VR::LO => Some(64),
        VR::LT => Some(10240),
        VR::PN => Some(64),
        VR::SH => Some(16),
        VR::ST => Some(1024),
        VR::TM => Some(16),
        VR::UI => Some(64),
        _ => None,
    }
}

/// The stand-in used by `replace` when no value is configured.
pub fn default_replacement(vr: VR) -> &'static str {
    match vr {
        VR::DA => "19000101",
        VR::DT => "19000101000000",
        VR::TM => "000000",
        VR::AS => "000Y",
        VR::DS | VR::IS | VR::FL | VR::FD | VR::SL | VR::SS | VR::SV | VR::UL | VR::US | VR::UV => {
            "0"
        }
        VR::PN => "ANONYMOUS",
        _ => "ANON",
    }
}

/// Validate that `op` can be applied to an attribute of the given VR.
/// Called when project configuration loads, so rewrites never have to.
pub fn check_operation(vr: VR, op: &TagOperation) -> Result<(), VrError> {
    let mismatch = |op: &'static str| VrError::OperationMismatch { op, vr };
    match op {
        TagOperation::Keep | TagOperation::Delete => Ok(()),
        TagOperation::Replace { value } => {
            if vr == VR::SQ {
                return Err(mismatch("replace"));
            }
            if let Some(value) = value {
                parse_for(vr, value).map(|_| ())
            } else {
                Ok(())
            }
        }
        TagOperation::ReplaceUid => {
            if vr == VR::UI {
                Ok(())
            } else {
                Err(mismatch("replace_UID"))
            }
        }
        TagOperation::SecureHash => {
            if is_string_like(vr) && vr != VR::UI {
                Ok(())
            } else {
                Err(mismatch("secure-hash"))
            }
        }
        TagOperation::DateShift => {
            if is_date_kind(vr) {
                Ok(())
            } else {
                Err(mismatch("date-shift"))
            }
        }
        TagOperation::DateFloor => {
            if matches!(vr, VR::DT | VR::TM) {
                Ok(())
            } else {
                Err(mismatch("date-floor"))
            }
        }
        TagOperation::NumRange { min, max } => {
            if !is_numeric(vr) {
                return Err(mismatch("num-range"));
            }
            if min > max {
                return Err(VrError::Incompatible {
                    vr,
                    value: format!("min {min} > max {max}"),
                });
            }
            Ok(())
        }
    }
}

/// Build a primitive value of the given VR from configured text.
pub fn parse_for(vr: VR, value: &str) -> Result<PrimitiveValue, VrError> {
    let incompatible = || VrError::Incompatible {
        vr,
        value: value.to_string(),
    };
    match vr {
        VR::US => value
            .trim()
            .parse::<u16>()
            .map(PrimitiveValue::from)
            .map_err(|_| incompatible()),
        VR::UL => value
            .trim()
            .parse::<u32>()
            .map(PrimitiveValue::from)
            .map_err(|_| incompatible()),
        VR::SS => value
            .trim()
            .parse::<i16>()
            .map(PrimitiveValue::from)
            .map_err(|_| incompatible()),
        VR::SL => value
            .trim()
            .parse::<i32>()
            .map(PrimitiveValue::from)
            .map_err(|_| incompatible()),
        VR::SV => value
            .trim()
            .parse::<i64>()
            .map(PrimitiveValue::from)
            .map_err(|_| incompatible()),
        VR::UV => value
            .trim()
            .parse::<u64>()
            .map(PrimitiveValue::from)
            .map_err(|_| incompatible()),
        VR::FL => value
            .trim()
            .parse::<f32>()
            .map(PrimitiveValue::from)
            .map_err(|_| incompatible()),
        VR::FD => value
            .trim()
            .parse::<f64>()
            .map(PrimitiveValue::from)
            .map_err(|_| incompatible()),
        VR::IS => {
            value.trim().parse::<i64>().map_err(|_| incompatible())?;
            Ok(PrimitiveValue::from(value))
        }
        VR::DS => {
            value.trim().parse::<f64>().map_err(|_| incompatible())?;
            Ok(PrimitiveValue::from(value))
        }
        VR::DA => {
            if crate::dates::parse_da(value).is_some() {
                Ok(PrimitiveValue::from(value))
            } else {
                Err(incompatible())
            }
        }
        _ => {
            if let Some(limit) = max_len(vr) {
                if value.len() > limit {
                    return Err(incompatible());
                }
            }
            Ok(PrimitiveValue::from(value))
        }
    }
}

/// Re-encode a clipped numeric as the attribute's VR.
pub fn number_for(vr: VR, value: f64) -> Result<PrimitiveValue, VrError> {
    let text = if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    };
    parse_for(vr, &text)
}
