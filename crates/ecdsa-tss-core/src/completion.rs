//! Signing completion
//!
//! The completer keeps its own [`SignManual`] and gathers the partial
//! signatures of the other signers until the final signature can be formed.

use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::protocol::SignManual;
use crate::{Error, PartialSignature, PartyId, Result, SignatureRecid};

/// Accumulates peers' partial signatures for one completer
#[derive(Debug)]
pub struct PartialSignatureCollector {
    sign: SignManual,
    partials: BTreeMap<PartyId, PartialSignature>,
}

impl PartialSignatureCollector {
    /// Start collecting for the completer owning `sign`
    pub fn new(sign: SignManual) -> Self {
        Self {
            sign,
            partials: BTreeMap::new(),
        }
    }

    /// Completer's own partial signature
    pub fn partial_signature(&self) -> &PartialSignature {
        self.sign.partial_signature()
    }

    /// Add a peer's partial signature
    ///
    /// Returns `false` if this signer already contributed; the first partial
    /// is kept.
    pub fn add(&mut self, partial: PartialSignature) -> Result<bool> {
        if partial.party == self.sign.party() {
            return Err(Error::InvalidSigningParties(format!(
                "party {} is the completer",
                partial.party
            )));
        }
        if !self.sign.signers().contains(&partial.party) {
            return Err(Error::InvalidSigningParties(format!(
                "party {} is not a signer",
                partial.party
            )));
        }
        if self.partials.contains_key(&partial.party) {
            debug!(party = partial.party, "Ignoring repeated partial signature");
            return Ok(false);
        }

        self.partials.insert(partial.party, partial);
        Ok(true)
    }

    /// Signers whose partial is still missing
    pub fn missing(&self) -> Vec<PartyId> {
        self.sign
            .signers()
            .iter()
            .copied()
            .filter(|p| *p != self.sign.party() && !self.partials.contains_key(p))
            .collect()
    }

    /// Final signature once every other signer has contributed
    pub fn try_complete(&self) -> Result<Option<SignatureRecid>> {
        let partials: Vec<PartialSignature> = self.partials.values().cloned().collect();
        let signature = self.sign.complete(&partials)?;
        if let Some(signature) = &signature {
            info!(
                completer = self.sign.party(),
                recid = signature.recid,
                "Signature completed"
            );
        }
        Ok(signature)
    }
}

/// Partial signatures of several signers
pub fn collect_partial_signatures<'a>(
    outputs: impl IntoIterator<Item = &'a SignManual>,
) -> Vec<PartialSignature> {
    outputs
        .into_iter()
        .map(|sign| sign.partial_signature().clone())
        .collect()
}

/// Complete a signature with the first output as completer
pub fn complete_signature(outputs: &[SignManual]) -> Result<SignatureRecid> {
    let (completer, others) = outputs
        .split_first()
        .ok_or_else(|| Error::InvalidSigningParties("no signer outputs".into()))?;

    completer
        .complete(&collect_partial_signatures(others))?
        .ok_or_else(|| Error::ThresholdNotMet {
            required: completer.signers().len(),
            actual: outputs.len(),
        })
}
