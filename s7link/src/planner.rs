//! Request packing.
//!
//! Logical read/write items are packed into packages that each encode into
//! one S7 PDU under the negotiated size. Oversized items are split into
//! parts at the per-item limit and reassembled onto their parent buffers in
//! planned order once the responses arrive.

use crate::error::{Error, Result};
use crate::frame::{
    item::{ADDRESS_ITEM_LEN, DATA_ITEM_HEADER_LEN},
    PlcArea, ReadItem, ReturnCode, VarType, WriteItem,
};
use bytes::{Bytes, BytesMut};

/// Job header + function + item count on the request side.
const REQ_OVERHEAD: usize = 10 + 2;
/// AckData header + function + item count on the response side.
const RESP_OVERHEAD: usize = 12 + 2;
/// Smallest data item: header plus one payload byte plus its pad.
const MIN_ITEM_DATA: usize = DATA_ITEM_HEADER_LEN + 2;

/// Per-item budgets derived from the negotiated PDU size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    pub pdu_size: usize,
    pub read_item_max_len: usize,
    pub write_item_max_len: usize,
}

impl PlanLimits {
    pub fn new(pdu_size: u16) -> Self {
        let pdu = pdu_size as usize;
        Self {
            pdu_size: pdu,
            read_item_max_len: pdu.saturating_sub(18),
            write_item_max_len: pdu.saturating_sub(28),
        }
    }
}

/// A possibly-partial slice of a logical read item.
#[derive(Debug, Clone)]
pub struct ReadPart {
    /// Index of the logical item this part belongs to
    pub parent: usize,
    /// Byte offset of this part within the parent's result buffer
    pub offset_in_parent: usize,
    /// Response bytes this part produces
    pub len: usize,
    pub is_part: bool,
    /// The request item actually sent for this part
    pub item: ReadItem,
}

/// Items sharing one request PDU.
#[derive(Debug, Clone)]
pub struct ReadPackage {
    pdu_budget: usize,
    pub parts: Vec<ReadPart>,
    pub used_param_bytes: usize,
    pub used_data_bytes: usize,
    pub full: bool,
    pub handled: bool,
}

impl ReadPackage {
    fn new(pdu_budget: usize) -> Self {
        Self {
            pdu_budget,
            parts: Vec::new(),
            used_param_bytes: 0,
            used_data_bytes: 0,
            full: false,
            handled: false,
        }
    }

    pub fn items(&self) -> Vec<ReadItem> {
        self.parts.iter().map(|p| p.item).collect()
    }

    fn fits(&self, response_len: usize) -> bool {
        let param = self.used_param_bytes + ADDRESS_ITEM_LEN;
        let data = self.used_data_bytes + DATA_ITEM_HEADER_LEN + response_len + (response_len & 1);
        REQ_OVERHEAD + param <= self.pdu_budget && RESP_OVERHEAD + data <= self.pdu_budget
    }

    /// Add the part, or hand it back when it does not fit.
    fn try_add(&mut self, part: ReadPart) -> std::result::Result<(), ReadPart> {
        if self.full || !self.fits(part.len) {
            return Err(part);
        }
        self.used_param_bytes += ADDRESS_ITEM_LEN;
        self.used_data_bytes += DATA_ITEM_HEADER_LEN + part.len + (part.len & 1);
        self.parts.push(part);
        if !self.fits(1) || self.parts.len() >= u8::MAX as usize {
            self.full = true;
        }
        Ok(())
    }
}

/// Planned read: packages in emission order plus the reassembly mapping.
#[derive(Debug, Clone)]
pub struct ReadPlan {
    pub packages: Vec<ReadPackage>,
    item_count: usize,
    per_item_len: Vec<usize>,
}

/// Result of one logical read item after reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    pub return_code: ReturnCode,
    pub data: Bytes,
}

#[inline]
fn splittable(item: &ReadItem) -> bool {
    !matches!(item.var_type, VarType::Bit) && !matches!(item.area, PlcArea::Timer | PlcArea::Counter)
}

#[inline]
fn byte_offset_of(item: &ReadItem) -> u32 {
    match item.var_type {
        VarType::Bit => item.offset / 8,
        _ => item.offset,
    }
}

/// Pack logical read items into PDU-sized packages, largest first.
pub fn plan_read(limits: PlanLimits, items: &[ReadItem]) -> Result<ReadPlan> {
    if limits.read_item_max_len < 1 {
        return Err(Error::CouldNotAddPackage);
    }

    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|&a, &b| items[b].wire_len().cmp(&items[a].wire_len()));

    let mut open: Vec<ReadPackage> = Vec::new();
    let mut emitted: Vec<ReadPackage> = Vec::new();

    for index in order {
        let item = items[index];
        let total = item.wire_len();
        if total <= limits.read_item_max_len {
            let part = ReadPart {
                parent: index,
                offset_in_parent: 0,
                len: total,
                is_part: false,
                item,
            };
            place(limits, &mut open, &mut emitted, part)?;
        } else {
            if !splittable(&item) {
                return Err(Error::ToMuchDataPerCall {
                    limit: limits.read_item_max_len,
                    attempted: total,
                });
            }
            let base = byte_offset_of(&item);
            let mut done = 0usize;
            while done < total {
                let chunk = (total - done).min(limits.read_item_max_len);
                let part = ReadPart {
                    parent: index,
                    offset_in_parent: done,
                    len: chunk,
                    is_part: true,
                    item: ReadItem {
                        area: item.area,
                        offset: base + done as u32,
                        var_type: VarType::Byte,
                        count: chunk as u16,
                    },
                };
                place(limits, &mut open, &mut emitted, part)?;
                done += chunk;
            }
        }
    }

    for mut package in open {
        if !package.parts.is_empty() {
            package.handled = true;
            emitted.push(package);
        }
    }

    Ok(ReadPlan {
        packages: emitted,
        item_count: items.len(),
        per_item_len: items.iter().map(ReadItem::wire_len).collect(),
    })
}

/// First-fit placement across open packages; full packages are emitted
/// eagerly so large parts stream out as soon as they saturate one PDU.
fn place(
    limits: PlanLimits,
    open: &mut Vec<ReadPackage>,
    emitted: &mut Vec<ReadPackage>,
    part: ReadPart,
) -> Result<()> {
    let mut part = part;
    for package in open.iter_mut() {
        match package.try_add(part) {
            Ok(()) => {
                drain_full(open, emitted);
                return Ok(());
            }
            Err(returned) => part = returned,
        }
    }
    // no open package fits; start a new one
    let mut package = ReadPackage::new(limits.pdu_size);
    if package.try_add(part).is_err() {
        return Err(Error::CouldNotAddPackage);
    }
    open.push(package);
    drain_full(open, emitted);
    Ok(())
}

fn drain_full(open: &mut Vec<ReadPackage>, emitted: &mut Vec<ReadPackage>) {
    let mut i = 0;
    while i < open.len() {
        if open[i].full {
            let mut package = open.remove(i);
            package.handled = true;
            emitted.push(package);
        } else {
            i += 1;
        }
    }
}

impl ReadPlan {
    /// Reassemble decoded responses, package by package in emission order.
    ///
    /// `responses[i]` must hold exactly one `(return code, data)` pair per
    /// part of `packages[i]`, in send order; any count mismatch is fatal.
    pub fn merge(&self, responses: &[Vec<(ReturnCode, Bytes)>]) -> Result<Vec<ReadResult>> {
        if responses.len() != self.packages.len() {
            return Err(Error::InvalidFrame);
        }
        let mut slots: Vec<Option<(ReturnCode, BytesMut)>> = vec![None; self.item_count];

        for (package, answers) in self.packages.iter().zip(responses) {
            if answers.len() != package.parts.len() {
                return Err(Error::InvalidFrame);
            }
            for (part, (code, data)) in package.parts.iter().zip(answers) {
                let slot = slots[part.parent].get_or_insert_with(|| {
                    let mut buf = BytesMut::with_capacity(self.per_item_len[part.parent]);
                    buf.resize(self.per_item_len[part.parent], 0);
                    (ReturnCode::Success, buf)
                });
                if slot.0.is_success() && !code.is_success() {
                    slot.0 = *code;
                }
                let room = slot.1.len().saturating_sub(part.offset_in_parent);
                let copy_len = part.len.min(data.len()).min(room);
                if copy_len > 0 {
                    slot.1[part.offset_in_parent..part.offset_in_parent + copy_len]
                        .copy_from_slice(&data[..copy_len]);
                }
            }
        }

        slots
            .into_iter()
            .map(|slot| {
                let (return_code, buf) = slot.ok_or(Error::Decode {
                    context: "logical item missing from plan",
                })?;
                Ok(ReadResult {
                    return_code,
                    data: buf.freeze(),
                })
            })
            .collect()
    }
}

// ===== Writes =====

/// A possibly-partial slice of a logical write item.
#[derive(Debug, Clone)]
pub struct WritePart {
    pub parent: usize,
    pub is_part: bool,
    /// The request item actually sent for this part
    pub item: WriteItem,
}

/// Write items sharing one request PDU.
#[derive(Debug, Clone)]
pub struct WritePackage {
    pdu_budget: usize,
    pub parts: Vec<WritePart>,
    pub used_param_bytes: usize,
    pub used_data_bytes: usize,
    pub full: bool,
    pub handled: bool,
}

impl WritePackage {
    fn new(pdu_budget: usize) -> Self {
        Self {
            pdu_budget,
            parts: Vec::new(),
            used_param_bytes: 0,
            used_data_bytes: 0,
            full: false,
            handled: false,
        }
    }

    pub fn items(&self) -> Vec<WriteItem> {
        self.parts.iter().map(|p| p.item.clone()).collect()
    }

    fn fits(&self, payload_len: usize) -> bool {
        let param = self.used_param_bytes + ADDRESS_ITEM_LEN;
        let data = self.used_data_bytes + DATA_ITEM_HEADER_LEN + payload_len + (payload_len & 1);
        // request carries both blocks; the response is one code per item
        REQ_OVERHEAD + param + data <= self.pdu_budget
            && RESP_OVERHEAD + self.parts.len() + 1 <= self.pdu_budget
    }

    /// Add the part, or hand it back when it does not fit.
    fn try_add(&mut self, part: WritePart) -> std::result::Result<(), WritePart> {
        let payload_len = part.item.data.len();
        if self.full || !self.fits(payload_len) {
            return Err(part);
        }
        self.used_param_bytes += ADDRESS_ITEM_LEN;
        self.used_data_bytes += DATA_ITEM_HEADER_LEN + payload_len + (payload_len & 1);
        self.parts.push(part);
        if self.used_param_bytes
            + self.used_data_bytes
            + REQ_OVERHEAD
            + ADDRESS_ITEM_LEN
            + MIN_ITEM_DATA
            > self.pdu_budget
            || self.parts.len() >= u8::MAX as usize
        {
            self.full = true;
        }
        Ok(())
    }
}

/// Planned write: packages in emission order plus the merge mapping.
#[derive(Debug, Clone)]
pub struct WritePlan {
    pub packages: Vec<WritePackage>,
    item_count: usize,
}

/// Pack logical write items, splitting oversized payloads at the write
/// item limit.
pub fn plan_write(limits: PlanLimits, items: &[WriteItem]) -> Result<WritePlan> {
    if limits.write_item_max_len < 1 {
        return Err(Error::CouldNotAddPackage);
    }

    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|&a, &b| items[b].data.len().cmp(&items[a].data.len()));

    let mut open: Vec<WritePackage> = Vec::new();
    let mut emitted: Vec<WritePackage> = Vec::new();

    for index in order {
        let wi = &items[index];
        let total = wi.data.len();
        if total <= limits.write_item_max_len {
            let part = WritePart {
                parent: index,
                is_part: false,
                item: wi.clone(),
            };
            place_write(limits, &mut open, &mut emitted, part)?;
        } else {
            if !splittable(&wi.item) {
                return Err(Error::ToMuchDataPerCall {
                    limit: limits.write_item_max_len,
                    attempted: total,
                });
            }
            let base = byte_offset_of(&wi.item);
            let mut done = 0usize;
            while done < total {
                let chunk = (total - done).min(limits.write_item_max_len);
                let part = WritePart {
                    parent: index,
                    is_part: true,
                    item: WriteItem {
                        item: ReadItem {
                            area: wi.item.area,
                            offset: base + done as u32,
                            var_type: VarType::Byte,
                            count: chunk as u16,
                        },
                        data: wi.data.slice(done..done + chunk),
                    },
                };
                place_write(limits, &mut open, &mut emitted, part)?;
                done += chunk;
            }
        }
    }

    for mut package in open {
        if !package.parts.is_empty() {
            package.handled = true;
            emitted.push(package);
        }
    }

    Ok(WritePlan {
        packages: emitted,
        item_count: items.len(),
    })
}

fn place_write(
    limits: PlanLimits,
    open: &mut Vec<WritePackage>,
    emitted: &mut Vec<WritePackage>,
    part: WritePart,
) -> Result<()> {
    let mut part = part;
    for package in open.iter_mut() {
        match package.try_add(part) {
            Ok(()) => {
                drain_full_write(open, emitted);
                return Ok(());
            }
            Err(returned) => part = returned,
        }
    }
    let mut package = WritePackage::new(limits.pdu_size);
    if package.try_add(part).is_err() {
        return Err(Error::CouldNotAddPackage);
    }
    open.push(package);
    drain_full_write(open, emitted);
    Ok(())
}

fn drain_full_write(open: &mut Vec<WritePackage>, emitted: &mut Vec<WritePackage>) {
    let mut i = 0;
    while i < open.len() {
        if open[i].full {
            let mut package = open.remove(i);
            package.handled = true;
            emitted.push(package);
        } else {
            i += 1;
        }
    }
}

impl WritePlan {
    /// Collapse per-part acknowledgements back onto the logical items; the
    /// first non-OK code observed wins.
    pub fn merge(&self, responses: &[Vec<ReturnCode>]) -> Result<Vec<ReturnCode>> {
        if responses.len() != self.packages.len() {
            return Err(Error::InvalidFrame);
        }
        let mut codes = vec![ReturnCode::Success; self.item_count];
        let mut seen = vec![false; self.item_count];
        for (package, answers) in self.packages.iter().zip(responses) {
            if answers.len() != package.parts.len() {
                return Err(Error::InvalidFrame);
            }
            for (part, code) in package.parts.iter().zip(answers) {
                seen[part.parent] = true;
                if codes[part.parent].is_success() && !code.is_success() {
                    codes[part.parent] = *code;
                }
            }
        }
        if seen.iter().any(|s| !s) {
            return Err(Error::Decode {
                context: "logical item missing from plan",
            });
        }
        Ok(codes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::build_write_job;

    fn db_read(db: u16, offset: u32, count: u16) -> ReadItem {
        ReadItem {
            area: PlcArea::DataBlock(db),
            offset,
            var_type: VarType::Byte,
            count,
        }
    }

    fn assert_package_budgets(plan: &ReadPlan, pdu: usize) {
        for package in &plan.packages {
            assert!(package.handled);
            let req = REQ_OVERHEAD + package.used_param_bytes;
            let resp = RESP_OVERHEAD + package.used_data_bytes;
            assert!(req <= pdu, "request {req} > {pdu}");
            assert!(resp <= pdu, "response {resp} > {pdu}");
        }
    }

    #[test]
    fn three_small_items_share_one_package() {
        let limits = PlanLimits::new(240);
        let items = [db_read(1, 0, 20), db_read(1, 100, 20), db_read(2, 0, 20)];
        let plan = plan_read(limits, &items).unwrap();
        assert_eq!(plan.packages.len(), 1);
        assert_eq!(plan.packages[0].parts.len(), 3);
        assert_package_budgets(&plan, 240);
    }

    #[test]
    fn oversized_item_splits_at_the_item_limit() {
        let limits = PlanLimits::new(480);
        assert_eq!(limits.read_item_max_len, 462);
        let plan = plan_read(limits, &[db_read(1, 0, 900)]).unwrap();
        let parts: Vec<&ReadPart> = plan
            .packages
            .iter()
            .flat_map(|p| p.parts.iter())
            .collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len, 462);
        assert_eq!(parts[1].len, 438);
        assert!(parts.iter().all(|p| p.is_part));
        assert_eq!(parts[1].item.offset, 462);
        assert_eq!(plan.packages.len(), 2);
        assert_package_budgets(&plan, 480);
    }

    #[test]
    fn split_item_reassembles_contiguously() {
        let limits = PlanLimits::new(480);
        let plan = plan_read(limits, &[db_read(1, 0, 900)]).unwrap();

        // answer each part with bytes derived from its parent offset
        let responses: Vec<Vec<(ReturnCode, Bytes)>> = plan
            .packages
            .iter()
            .map(|p| {
                p.parts
                    .iter()
                    .map(|part| {
                        let data: Vec<u8> = (0..part.len)
                            .map(|i| ((part.offset_in_parent + i) % 251) as u8)
                            .collect();
                        (ReturnCode::Success, Bytes::from(data))
                    })
                    .collect()
            })
            .collect();

        let merged = plan.merge(&responses).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].data.len(), 900);
        for (i, b) in merged[0].data.iter().enumerate() {
            assert_eq!(*b, (i % 251) as u8, "byte {i}");
        }
    }

    #[test]
    fn every_byte_lands_exactly_once_across_mixed_items() {
        let limits = PlanLimits::new(240);
        let items = [
            db_read(1, 0, 500),
            db_read(2, 8, 17),
            ReadItem {
                area: PlcArea::FlagByte,
                offset: 10 * 8 + 2,
                var_type: VarType::Bit,
                count: 1,
            },
            db_read(3, 0, 223),
        ];
        let plan = plan_read(limits, &items).unwrap();
        assert_package_budgets(&plan, 240);

        // per logical item, collect covered ranges
        let mut covered: Vec<Vec<bool>> = items.iter().map(|i| vec![false; i.wire_len()]).collect();
        for package in &plan.packages {
            for part in &package.parts {
                for pos in part.offset_in_parent..part.offset_in_parent + part.len {
                    assert!(!covered[part.parent][pos], "byte covered twice");
                    covered[part.parent][pos] = true;
                }
            }
        }
        for item_cover in covered {
            assert!(item_cover.iter().all(|c| *c), "byte left uncovered");
        }
    }

    #[test]
    fn tiny_pdu_cannot_host_a_package() {
        assert!(matches!(
            plan_read(PlanLimits::new(16), &[db_read(1, 0, 1)]),
            Err(Error::CouldNotAddPackage)
        ));
    }

    #[test]
    fn unsplittable_oversized_item_is_a_user_error() {
        // a Timer block read cannot be split into byte chunks
        let limits = PlanLimits::new(240);
        let item = ReadItem {
            area: PlcArea::Timer,
            offset: 0,
            var_type: VarType::Word,
            count: 200,
        };
        assert!(matches!(
            plan_read(limits, &[item]),
            Err(Error::ToMuchDataPerCall { .. })
        ));
    }

    #[test]
    fn first_non_ok_code_wins_for_parts() {
        let limits = PlanLimits::new(480);
        let plan = plan_read(limits, &[db_read(1, 0, 900)]).unwrap();
        let mut responses: Vec<Vec<(ReturnCode, Bytes)>> = plan
            .packages
            .iter()
            .map(|p| {
                p.parts
                    .iter()
                    .map(|part| (ReturnCode::Success, Bytes::from(vec![0u8; part.len])))
                    .collect()
            })
            .collect();
        responses[1][0].0 = ReturnCode::AddressOutOfRange;
        let merged = plan.merge(&responses).unwrap();
        assert_eq!(merged[0].return_code, ReturnCode::AddressOutOfRange);
    }

    #[test]
    fn response_count_mismatch_is_fatal() {
        let limits = PlanLimits::new(240);
        let plan = plan_read(limits, &[db_read(1, 0, 4)]).unwrap();
        assert!(plan.merge(&[]).is_err());
        assert!(plan.merge(&[vec![]]).is_err());
    }

    #[test]
    fn write_packages_encode_under_the_pdu_size() {
        let limits = PlanLimits::new(240);
        let items: Vec<WriteItem> = (0..6)
            .map(|i| {
                WriteItem::new(
                    db_read(1, i * 64, 61),
                    Bytes::from(vec![i as u8; 61]),
                )
            })
            .collect();
        let plan = plan_write(limits, &items).unwrap();
        for package in &plan.packages {
            let raw = build_write_job(1, &package.items());
            assert!(raw.len() <= 240, "encoded write {} > 240", raw.len());
        }
        let answers: Vec<Vec<ReturnCode>> = plan
            .packages
            .iter()
            .map(|p| vec![ReturnCode::Success; p.parts.len()])
            .collect();
        assert_eq!(plan.merge(&answers).unwrap(), vec![ReturnCode::Success; 6]);
    }

    #[test]
    fn oversized_write_splits_and_merges_codes() {
        let limits = PlanLimits::new(240);
        assert_eq!(limits.write_item_max_len, 212);
        let item = WriteItem::new(db_read(1, 0, 500), Bytes::from(vec![7u8; 500]));
        let plan = plan_write(limits, &[item]).unwrap();
        let parts: Vec<&WritePart> = plan
            .packages
            .iter()
            .flat_map(|p| p.parts.iter())
            .collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].item.data.len(), 212);
        assert_eq!(parts[2].item.data.len(), 500 - 2 * 212);
        assert_eq!(parts[1].item.item.offset, 212);

        let mut answers: Vec<Vec<ReturnCode>> = plan
            .packages
            .iter()
            .map(|p| vec![ReturnCode::Success; p.parts.len()])
            .collect();
        answers[2][0] = ReturnCode::AccessDenied;
        assert_eq!(plan.merge(&answers).unwrap(), vec![ReturnCode::AccessDenied]);
    }
}
