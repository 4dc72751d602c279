//! m-of-n multisig scripts.
//!
//! Input scripts exist in three serialization forms:
//!
//! - SIGN: the bare redeem script, used as the script code when computing a
//!   signing digest;
//! - EDIT: `OP_0 <slot per pubkey> <redeem>` where a slot is either a
//!   signature push or an `OP_0` placeholder, so partially signed scripts
//!   keep their signature/pubkey alignment;
//! - BROADCAST: `OP_0 <collected sigs> <redeem>`, the network form emitted
//!   once no more signatures are needed.

use vaultd_primitives::hash::hash160;

pub const MAX_MULTISIG_KEYS: usize = 16;

const OP_0: u8 = 0x00;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_HASH160: u8 = 0xa9;
const OP_EQUAL: u8 = 0x87;
const OP_CHECKMULTISIG: u8 = 0xae;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    NotPushOnly,
    Malformed(&'static str),
    RedeemScriptMismatch,
    UnknownSigner,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::NotPushOnly => write!(f, "input script is not push-only"),
            ScriptError::Malformed(message) => write!(f, "{message}"),
            ScriptError::RedeemScriptMismatch => write!(f, "redeem scripts differ"),
            ScriptError::UnknownSigner => write!(f, "public key is not part of this script"),
        }
    }
}

impl std::error::Error for ScriptError {}

/// `OP_m <pubkey>... OP_n OP_CHECKMULTISIG`. Callers pass pubkeys in the
/// canonical (sorted) order so identical key sets yield identical scripts.
pub fn multisig_redeem_script(min_sigs: usize, pubkeys: &[Vec<u8>]) -> Result<Vec<u8>, ScriptError> {
    let n = pubkeys.len();
    if n == 0 || n > MAX_MULTISIG_KEYS {
        return Err(ScriptError::Malformed("invalid multisig key count"));
    }
    if min_sigs == 0 || min_sigs > n {
        return Err(ScriptError::Malformed("invalid multisig threshold"));
    }
    let mut script = Vec::with_capacity(3 + n * 34);
    script.push(OP_1 + (min_sigs as u8 - 1));
    for pubkey in pubkeys {
        if pubkey.len() != 33 && pubkey.len() != 65 {
            return Err(ScriptError::Malformed("invalid pubkey length"));
        }
        push_data(&mut script, pubkey);
    }
    script.push(OP_1 + (n as u8 - 1));
    script.push(OP_CHECKMULTISIG);
    Ok(script)
}

/// `OP_HASH160 <hash160(redeem)> OP_EQUAL`.
pub fn p2sh_script_pubkey(redeem_script: &[u8]) -> Vec<u8> {
    let digest = hash160(redeem_script);
    let mut script = Vec::with_capacity(23);
    script.push(OP_HASH160);
    script.push(20);
    script.extend_from_slice(&digest);
    script.push(OP_EQUAL);
    script
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InputScript {
    min_sigs: usize,
    pubkeys: Vec<Vec<u8>>,
    sigs: Vec<Option<Vec<u8>>>,
    redeem_script: Vec<u8>,
}

impl InputScript {
    /// Fresh template with every signature slot empty.
    pub fn from_redeem_script(redeem_script: &[u8]) -> Result<Self, ScriptError> {
        let (min_sigs, pubkeys) = parse_redeem_script(redeem_script)?;
        let slots = pubkeys.len();
        Ok(Self {
            min_sigs,
            pubkeys,
            sigs: vec![None; slots],
            redeem_script: redeem_script.to_vec(),
        })
    }

    /// Parses an EDIT- or BROADCAST-form input script. BROADCAST-form
    /// signatures lose their pubkey alignment; they are assigned to the
    /// leading slots, which preserves signature counts (all a fully signed
    /// script needs).
    pub fn parse(script_sig: &[u8]) -> Result<Self, ScriptError> {
        let items = parse_push_items(script_sig)?;
        if items.len() < 3 {
            return Err(ScriptError::Malformed("too few input script items"));
        }
        if !items[0].is_empty() {
            return Err(ScriptError::Malformed("missing CHECKMULTISIG dummy"));
        }
        let redeem_script = items[items.len() - 1].clone();
        let (min_sigs, pubkeys) = parse_redeem_script(&redeem_script)?;
        let slots = &items[1..items.len() - 1];
        if slots.len() > pubkeys.len() {
            return Err(ScriptError::Malformed("more signature slots than keys"));
        }

        let mut sigs = vec![None; pubkeys.len()];
        for (slot, item) in slots.iter().enumerate() {
            if !item.is_empty() {
                sigs[slot] = Some(item.clone());
            }
        }
        Ok(Self {
            min_sigs,
            pubkeys,
            sigs,
            redeem_script,
        })
    }

    pub fn min_sigs(&self) -> usize {
        self.min_sigs
    }

    pub fn pubkeys(&self) -> &[Vec<u8>] {
        &self.pubkeys
    }

    pub fn redeem_script(&self) -> &[u8] {
        &self.redeem_script
    }

    pub fn present_sig_count(&self) -> usize {
        self.sigs.iter().filter(|sig| sig.is_some()).count()
    }

    pub fn sigs_needed(&self) -> usize {
        self.min_sigs.saturating_sub(self.present_sig_count())
    }

    pub fn is_complete(&self) -> bool {
        self.sigs_needed() == 0
    }

    /// Pubkeys whose slots still carry no signature.
    pub fn missing_sig_pubkeys(&self) -> Vec<Vec<u8>> {
        self.pubkeys
            .iter()
            .zip(self.sigs.iter())
            .filter_map(|(pubkey, sig)| sig.is_none().then(|| pubkey.clone()))
            .collect()
    }

    /// Stores `sig` in the slot of `pubkey`. Fails with `UnknownSigner` when
    /// the pubkey is not part of the script; returns false when the slot is
    /// already filled.
    pub fn add_sig(&mut self, pubkey: &[u8], sig: Vec<u8>) -> Result<bool, ScriptError> {
        let slot = self
            .pubkeys
            .iter()
            .position(|candidate| candidate.as_slice() == pubkey)
            .ok_or(ScriptError::UnknownSigner)?;
        if self.sigs[slot].is_some() {
            return Ok(false);
        }
        self.sigs[slot] = Some(sig);
        Ok(true)
    }

    /// Copies signatures present in `other` into our empty slots. Returns
    /// the number of signatures gained.
    pub fn merge_sigs(&mut self, other: &InputScript) -> Result<usize, ScriptError> {
        if self.redeem_script != other.redeem_script {
            return Err(ScriptError::RedeemScriptMismatch);
        }
        let mut added = 0;
        for (slot, sig) in other.sigs.iter().enumerate() {
            if self.sigs[slot].is_none() {
                if let Some(sig) = sig {
                    self.sigs[slot] = Some(sig.clone());
                    added += 1;
                }
            }
        }
        Ok(added)
    }

    /// SIGN form: the script code hashed when producing a signature.
    pub fn sign_script(&self) -> Vec<u8> {
        self.redeem_script.clone()
    }

    /// EDIT form: placeholders keep unsigned slots addressable.
    pub fn edit_script(&self) -> Vec<u8> {
        let mut script = vec![OP_0];
        for sig in &self.sigs {
            match sig {
                Some(sig) => push_data(&mut script, sig),
                None => script.push(OP_0),
            }
        }
        push_data(&mut script, &self.redeem_script);
        script
    }

    /// BROADCAST form: placeholders dropped.
    pub fn broadcast_script(&self) -> Vec<u8> {
        let mut script = vec![OP_0];
        for sig in self.sigs.iter().flatten() {
            push_data(&mut script, sig);
        }
        push_data(&mut script, &self.redeem_script);
        script
    }

    /// EDIT while signatures are still missing, BROADCAST once complete.
    pub fn current_script(&self) -> Vec<u8> {
        if self.is_complete() {
            self.broadcast_script()
        } else {
            self.edit_script()
        }
    }

    pub fn txout_script(&self) -> Vec<u8> {
        p2sh_script_pubkey(&self.redeem_script)
    }
}

fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0 => script.push(OP_0),
        len @ 1..=75 => {
            script.push(len as u8);
            script.extend_from_slice(data);
        }
        len @ 76..=255 => {
            script.push(OP_PUSHDATA1);
            script.push(len as u8);
            script.extend_from_slice(data);
        }
        len => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(len as u16).to_le_bytes());
            script.extend_from_slice(data);
        }
    }
}

fn parse_push_items(script: &[u8]) -> Result<Vec<Vec<u8>>, ScriptError> {
    let mut items = Vec::new();
    let mut cursor = 0usize;
    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        let len = match opcode {
            OP_0 => 0,
            1..=75 => opcode as usize,
            OP_PUSHDATA1 => {
                let len = *script
                    .get(cursor)
                    .ok_or(ScriptError::Malformed("truncated OP_PUSHDATA1"))?
                    as usize;
                cursor += 1;
                len
            }
            OP_PUSHDATA2 => {
                if cursor + 2 > script.len() {
                    return Err(ScriptError::Malformed("truncated OP_PUSHDATA2"));
                }
                let len = u16::from_le_bytes([script[cursor], script[cursor + 1]]) as usize;
                cursor += 2;
                len
            }
            _ => return Err(ScriptError::NotPushOnly),
        };
        if cursor + len > script.len() {
            return Err(ScriptError::Malformed("push runs past end of script"));
        }
        items.push(script[cursor..cursor + len].to_vec());
        cursor += len;
    }
    Ok(items)
}

fn parse_redeem_script(redeem_script: &[u8]) -> Result<(usize, Vec<Vec<u8>>), ScriptError> {
    let last = redeem_script
        .last()
        .copied()
        .ok_or(ScriptError::Malformed("empty redeem script"))?;
    if last != OP_CHECKMULTISIG {
        return Err(ScriptError::Malformed("missing OP_CHECKMULTISIG"));
    }
    let first = redeem_script[0];
    if !(OP_1..=OP_16).contains(&first) {
        return Err(ScriptError::Malformed("invalid multisig threshold opcode"));
    }
    let min_sigs = (first - OP_1 + 1) as usize;

    let body = &redeem_script[1..redeem_script.len() - 2];
    let pubkeys = parse_push_items(body)?;
    for pubkey in &pubkeys {
        if pubkey.len() != 33 && pubkey.len() != 65 {
            return Err(ScriptError::Malformed("invalid pubkey length"));
        }
    }

    let count_opcode = redeem_script[redeem_script.len() - 2];
    if !(OP_1..=OP_16).contains(&count_opcode) {
        return Err(ScriptError::Malformed("invalid multisig key count opcode"));
    }
    let n = (count_opcode - OP_1 + 1) as usize;
    if n != pubkeys.len() || min_sigs > n {
        return Err(ScriptError::Malformed("multisig key count mismatch"));
    }
    Ok((min_sigs, pubkeys))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_pubkey(tag: u8) -> Vec<u8> {
        let mut pubkey = vec![0x02];
        pubkey.extend_from_slice(&[tag; 32]);
        pubkey
    }

    fn two_of_three() -> InputScript {
        let pubkeys = vec![fake_pubkey(1), fake_pubkey(2), fake_pubkey(3)];
        let redeem = multisig_redeem_script(2, &pubkeys).expect("redeem");
        InputScript::from_redeem_script(&redeem).expect("template")
    }

    #[test]
    fn redeem_script_shape() {
        let pubkeys = vec![fake_pubkey(1), fake_pubkey(2)];
        let redeem = multisig_redeem_script(1, &pubkeys).expect("redeem");
        assert_eq!(redeem[0], OP_1);
        assert_eq!(redeem[redeem.len() - 2], OP_1 + 1);
        assert_eq!(redeem[redeem.len() - 1], OP_CHECKMULTISIG);

        let (min_sigs, parsed) = parse_redeem_script(&redeem).expect("parse");
        assert_eq!(min_sigs, 1);
        assert_eq!(parsed, pubkeys);
    }

    #[test]
    fn rejects_bad_thresholds() {
        let pubkeys = vec![fake_pubkey(1)];
        assert!(multisig_redeem_script(0, &pubkeys).is_err());
        assert!(multisig_redeem_script(2, &pubkeys).is_err());
        assert!(multisig_redeem_script(1, &[]).is_err());
    }

    #[test]
    fn edit_roundtrip_preserves_slots() {
        let mut script = two_of_three();
        script
            .add_sig(&fake_pubkey(2), vec![0xaa; 70])
            .expect("known signer");

        let reparsed = InputScript::parse(&script.edit_script()).expect("parse");
        assert_eq!(reparsed, script);
        assert_eq!(reparsed.present_sig_count(), 1);
        assert_eq!(reparsed.sigs_needed(), 1);
        assert_eq!(
            reparsed.missing_sig_pubkeys(),
            vec![fake_pubkey(1), fake_pubkey(3)]
        );
    }

    #[test]
    fn merge_takes_only_new_signatures() {
        let mut ours = two_of_three();
        ours.add_sig(&fake_pubkey(1), vec![0x11; 70]).expect("add");

        let mut theirs = two_of_three();
        theirs.add_sig(&fake_pubkey(1), vec![0x99; 70]).expect("add");
        theirs.add_sig(&fake_pubkey(3), vec![0x33; 70]).expect("add");

        let added = ours.merge_sigs(&theirs).expect("merge");
        assert_eq!(added, 1);
        assert!(ours.is_complete());
        // Our existing slot was not overwritten.
        let reparsed = InputScript::parse(&ours.edit_script()).expect("parse");
        assert_eq!(reparsed.missing_sig_pubkeys(), vec![fake_pubkey(2)]);
    }

    #[test]
    fn broadcast_drops_placeholders() {
        let mut script = two_of_three();
        script.add_sig(&fake_pubkey(1), vec![0x11; 70]).expect("add");
        script.add_sig(&fake_pubkey(3), vec![0x33; 70]).expect("add");
        assert!(script.is_complete());

        let broadcast = script.broadcast_script();
        let items = parse_push_items(&broadcast).expect("items");
        // dummy + two sigs + redeem
        assert_eq!(items.len(), 4);
        assert!(items[0].is_empty());
        assert_eq!(items[1], vec![0x11; 70]);
        assert_eq!(items[2], vec![0x33; 70]);

        let reparsed = InputScript::parse(&broadcast).expect("parse broadcast");
        assert!(reparsed.is_complete());
    }

    #[test]
    fn unknown_signer_rejected() {
        let mut script = two_of_three();
        assert_eq!(
            script.add_sig(&fake_pubkey(9), vec![0x11; 70]),
            Err(ScriptError::UnknownSigner)
        );
    }

    #[test]
    fn p2sh_script_is_23_bytes() {
        let script = two_of_three();
        let txout = script.txout_script();
        assert_eq!(txout.len(), 23);
        assert_eq!(txout[0], OP_HASH160);
        assert_eq!(txout[22], OP_EQUAL);
    }
}
