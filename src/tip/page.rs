// TIP 页格式
//
// 页头：page_type(u8) sequence(u64) next_page(u32)，bincode 定长小端编码，
// 之后从 TIP_HEADER_SIZE 开始是 2 位一组的状态位图。

use super::{TipLayout, TIP_HEADER_SIZE};
use crate::error::{TxError, TxResult};
use crate::storage::PageNumber;
use crate::transactions::{TraNumber, TraState};
use serde::{Deserialize, Serialize};

pub const TIP_PAGE_TYPE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipPageHeader {
    pub page_type: u8,
    pub sequence: u64,
    /// 下一个 TIP 页，0 表示链尾
    pub next_page: PageNumber,
}

impl TipPageHeader {
    pub fn new(sequence: u64) -> Self {
        Self {
            page_type: TIP_PAGE_TYPE,
            sequence,
            next_page: 0,
        }
    }

    pub fn decode(page: PageNumber, data: &[u8]) -> TxResult<Self> {
        let header: Self = bincode::deserialize(&data[..TIP_HEADER_SIZE])?;
        if header.page_type != TIP_PAGE_TYPE {
            return Err(TxError::CorruptPage {
                page,
                reason: format!("expected TIP page, found type {}", header.page_type),
            });
        }
        Ok(header)
    }

    pub fn encode_into(&self, data: &mut [u8]) -> TxResult<()> {
        bincode::serialize_into(&mut data[..TIP_HEADER_SIZE], self)?;
        Ok(())
    }
}

/// 格式化一个新 TIP 页（所有状态为 Active）
pub fn format(data: &mut [u8], sequence: u64) -> TxResult<()> {
    data.fill(0);
    TipPageHeader::new(sequence).encode_into(data)
}

/// 修改页的后继指针
pub fn set_next(page: PageNumber, data: &mut [u8], next: PageNumber) -> TxResult<()> {
    let mut header = TipPageHeader::decode(page, data)?;
    header.next_page = next;
    header.encode_into(data)
}

fn read_bits(bitmap: &[u8], layout: &TipLayout, id: TraNumber) -> TraState {
    let loc = layout.locate(id);
    TraState::from_bits(bitmap[loc.byte] >> loc.shift)
}

/// 只读位图视图
pub struct TipBitmap<'a> {
    bitmap: &'a [u8],
    layout: TipLayout,
    sequence: u64,
}

impl<'a> TipBitmap<'a> {
    pub(crate) fn new(data: &'a [u8], layout: TipLayout, sequence: u64) -> Self {
        let end = TIP_HEADER_SIZE + layout.bitmap_len();
        Self {
            bitmap: &data[TIP_HEADER_SIZE..end],
            layout,
            sequence,
        }
    }

    pub fn first_id(&self) -> TraNumber {
        self.layout.first_id(self.sequence)
    }

    pub fn len(&self) -> u64 {
        self.layout.transactions_per_page()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self, id: TraNumber) -> TraState {
        debug_assert_eq!(self.layout.page_sequence(id), self.sequence);
        read_bits(self.bitmap, &self.layout, id)
    }

    /// 本页所有事务的状态
    pub fn states(&self) -> Vec<TraState> {
        let first = self.first_id();
        (first..first + self.len()).map(|id| self.state(id)).collect()
    }
}

/// 可写位图视图
pub struct TipBitmapMut<'a> {
    bitmap: &'a mut [u8],
    layout: TipLayout,
    sequence: u64,
}

impl<'a> TipBitmapMut<'a> {
    pub(crate) fn new(data: &'a mut [u8], layout: TipLayout, sequence: u64) -> Self {
        let end = TIP_HEADER_SIZE + layout.bitmap_len();
        Self {
            bitmap: &mut data[TIP_HEADER_SIZE..end],
            layout,
            sequence,
        }
    }

    pub fn state(&self, id: TraNumber) -> TraState {
        debug_assert_eq!(self.layout.page_sequence(id), self.sequence);
        read_bits(self.bitmap, &self.layout, id)
    }

    pub fn set_state(&mut self, id: TraNumber, state: TraState) -> TxResult<()> {
        if self.layout.page_sequence(id) != self.sequence {
            return Err(TxError::consistency(format!(
                "transaction {} does not belong to TIP page {}",
                id, self.sequence
            )));
        }
        let bits = state.to_bits().ok_or_else(|| {
            TxError::consistency(format!("state {} cannot be stored in TIP", state))
        })?;
        let loc = self.layout.locate(id);
        let byte = &mut self.bitmap[loc.byte];
        *byte = (*byte & !(0b11 << loc.shift)) | (bits << loc.shift);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_fixed_offsets() {
        let mut data = vec![0u8; 64];
        format(&mut data, 5).unwrap();
        set_next(1, &mut data, 9).unwrap();
        assert_eq!(data[0], TIP_PAGE_TYPE);
        assert_eq!(u64::from_le_bytes(data[1..9].try_into().unwrap()), 5);
        assert_eq!(u32::from_le_bytes(data[9..13].try_into().unwrap()), 9);

        let header = TipPageHeader::decode(1, &data).unwrap();
        assert_eq!(header.sequence, 5);
        assert_eq!(header.next_page, 9);
    }

    #[test]
    fn test_wrong_page_type() {
        let data = vec![1u8; 64];
        assert!(matches!(
            TipPageHeader::decode(4, &data),
            Err(TxError::CorruptPage { page: 4, .. })
        ));
    }

    #[test]
    fn test_set_and_get_bits() {
        let layout = TipLayout::new(16);
        let mut data = vec![0u8; TIP_HEADER_SIZE + layout.bitmap_len()];
        format(&mut data, 1).unwrap();
        {
            let mut bitmap = TipBitmapMut::new(&mut data, layout, 1);
            bitmap.set_state(17, TraState::Committed).unwrap();
            bitmap.set_state(18, TraState::Limbo).unwrap();
            bitmap.set_state(19, TraState::Dead).unwrap();
            bitmap.set_state(17, TraState::Dead).unwrap();
            assert!(bitmap.set_state(3, TraState::Dead).is_err());
            assert!(bitmap.set_state(20, TraState::Us).is_err());
        }
        let bitmap = TipBitmap::new(&data, layout, 1);
        assert_eq!(bitmap.first_id(), 16);
        assert_eq!(bitmap.state(16), TraState::Active);
        assert_eq!(bitmap.state(17), TraState::Dead);
        assert_eq!(bitmap.state(18), TraState::Limbo);
        assert_eq!(bitmap.state(19), TraState::Dead);
        assert_eq!(bitmap.states().len(), 16);
    }
}
