//! Secondary-factor authentication.
//!
//! Runs only when the face signal is inconclusive (require-fallback tier,
//! no usable face) or to resolve a face-ambiguity proxy flag. Exact token
//! lookup; fingerprint takes priority over ID card when both are supplied.

use std::sync::Arc;

use crate::store::{AttendanceStore, StoreError};
use crate::types::{AttendanceClaim, Factor, Student};

/// Result of a fallback lookup.
#[derive(Debug, Clone)]
pub enum FallbackOutcome {
    /// The token matched an enrolled student. Fallback confidence is exact,
    /// not probabilistic.
    Matched { student: Student, factor: Factor },
    /// The token was tried and matched nobody. Terminal rejection, distinct
    /// from "please supply a fallback".
    NotFound { factor: Factor },
    /// The claim carried no fallback token.
    NoTokenSupplied,
}

pub struct FallbackAuthenticator {
    store: Arc<dyn AttendanceStore>,
}

impl FallbackAuthenticator {
    pub fn new(store: Arc<dyn AttendanceStore>) -> Self {
        Self { store }
    }

    pub async fn authenticate(
        &self,
        claim: &AttendanceClaim,
    ) -> Result<FallbackOutcome, StoreError> {
        if let Some(token) = &claim.fingerprint_token {
            return match self.store.find_student_by_fingerprint(token).await? {
                Some(student) => {
                    tracing::info!(student = %student.roll_number, "fallback: fingerprint matched");
                    Ok(FallbackOutcome::Matched {
                        student,
                        factor: Factor::Fingerprint,
                    })
                }
                None => {
                    tracing::warn!("fallback: fingerprint token matched no student");
                    Ok(FallbackOutcome::NotFound {
                        factor: Factor::Fingerprint,
                    })
                }
            };
        }
        if let Some(token) = &claim.id_card_token {
            return match self.store.find_student_by_id_card(token).await? {
                Some(student) => {
                    tracing::info!(student = %student.roll_number, "fallback: id card matched");
                    Ok(FallbackOutcome::Matched {
                        student,
                        factor: Factor::IdCard,
                    })
                }
                None => {
                    tracing::warn!("fallback: id card token matched no student");
                    Ok(FallbackOutcome::NotFound {
                        factor: Factor::IdCard,
                    })
                }
            };
        }
        Ok(FallbackOutcome::NoTokenSupplied)
    }
}
