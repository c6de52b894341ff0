// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Protocol of the Object Table object, which gives its holder authority over
//! every entry: minting keys, inspecting them, and revoking them.

use abi::{selector, Brand, Exception, Message};

use crate::err::Failure;
use crate::key::TableIndex;
use crate::kernel::{Kernel, Keys};
use crate::sender::ReplySender;

fn brand_of(lo: u32, hi: u32) -> Brand {
    Brand::from(hi) << 32 | Brand::from(lo)
}

impl Kernel<'_> {
    fn checked_index(&self, index: u32) -> Result<TableIndex, Failure> {
        if index < self.table_len() {
            Ok(index)
        } else {
            Err(Failure::new(Exception::IndexOutOfRange, index))
        }
    }

    pub(crate) fn object_table_call(
        &mut self,
        _index: TableIndex,
        _brand: Brand,
        m: &Message,
        keys: &Keys,
    ) -> Result<ReplySender, Failure> {
        use selector::object_table::*;

        match m.desc.selector() {
            MINT_KEY => {
                let index = self.checked_index(m.data[0])?;
                let key = self
                    .make_key(index, brand_of(m.data[1], m.data[2]))
                    .ok_or(Failure::from(Exception::BadBrand))?;
                Ok(ReplySender::default().with_key(1, key))
            }
            READ_KEY => {
                let (index, brand) = self.resolve(keys[1]);
                Ok(ReplySender::data([
                    index,
                    brand as u32,
                    (brand >> 32) as u32,
                    0,
                ]))
            }
            GET_KIND => {
                let index = self.checked_index(m.data[0])?;
                let kind = self.object(index).kind();
                Ok(ReplySender::data([kind as u32, 0, 0, 0]))
            }
            INVALIDATE => {
                let index = self.checked_index(m.data[0])?;
                let rollover_ok = m.data[1] != 0;
                let e = &mut self.objects[index as usize];
                match e.generation.checked_next() {
                    Some(g) => e.generation = g,
                    None if rollover_ok => e.generation = e.generation.next(),
                    None => return Err(Exception::BadOperation.into()),
                }
                Ok(ReplySender::default())
            }
            other => Err(Failure::new(Exception::BadOperation, u32::from(other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use abi::{selector::object_table as sel, well_known, ObjectDesc, ObjectKind};
    use proptest::prelude::*;

    use super::*;
    use crate::key::{Generation, Key};
    use crate::testutil::Fixture;

    /// Key register holding the Object Table key after boot.
    const TABLE: usize = well_known::FIRST_CONTEXT_TABLE_KEY;

    #[test]
    fn mint_and_read_back() {
        let mut f = Fixture::boot(&[ObjectDesc::gate()]);
        let brand: Brand = 0x0123_4567_89ab_cdef;
        let r = f.call(
            TABLE,
            sel::MINT_KEY,
            [Fixture::EXTRA, brand as u32, (brand >> 32) as u32, 0],
        );
        assert_eq!(r.exception(), None);
        let k = f.key(f.first, 1);
        assert_eq!(f.kernel.resolve(k), (Fixture::EXTRA, brand));

        let r = f.call(TABLE, sel::READ_KEY, [0; 4]);
        assert_eq!(r.data[..3], [Fixture::EXTRA, 0x89ab_cdef, 0x0123_4567]);
    }

    #[test]
    fn mint_refusals() {
        let mut f = Fixture::boot(&[]);
        let len = f.kernel.table_len();
        let r = f.call(TABLE, sel::MINT_KEY, [len, 0, 0, 0]);
        assert_eq!(r.exception(), Some(Exception::IndexOutOfRange));
        assert_eq!(r.data[2], len);

        // The fixture's RAM object won't mint a key with a zero brand.
        let ram = f.kernel.resolve(f.key(f.first, 6)).0;
        let r = f.call(TABLE, sel::MINT_KEY, [ram, 0, 0, 0]);
        assert_eq!(r.exception(), Some(Exception::BadBrand));
    }

    #[test]
    fn get_kind_reports_codes() {
        let mut f = Fixture::boot(&[ObjectDesc::slot(), ObjectDesc::gate()]);
        for (index, kind) in [
            (well_known::NULL, ObjectKind::Null),
            (well_known::OBJECT_TABLE, ObjectKind::ObjectTable),
            (well_known::FIRST_CONTEXT, ObjectKind::Context),
            (well_known::FIRST_REPLY_GATE, ObjectKind::ReplyGate),
            (Fixture::EXTRA, ObjectKind::Slot),
            (Fixture::EXTRA + 1, ObjectKind::Gate),
        ] {
            let r = f.call(TABLE, sel::GET_KIND, [index, 0, 0, 0]);
            assert_eq!(r.data[0], kind as u32, "entry {index}");
        }
        let r = f.call(TABLE, sel::GET_KIND, [u32::MAX, 0, 0, 0]);
        assert_eq!(r.exception(), Some(Exception::IndexOutOfRange));
    }

    #[test]
    fn invalidate_refuses_to_wrap_unless_asked() {
        let mut f = Fixture::boot(&[ObjectDesc::gate()]);
        let g = Fixture::EXTRA;
        f.kernel.objects[g as usize].generation = Generation::from(u32::MAX);

        let r = f.call(TABLE, sel::INVALIDATE, [g, 0, 0, 0]);
        assert_eq!(r.exception(), Some(Exception::BadOperation));
        assert_eq!(
            f.kernel.objects()[g as usize].generation,
            Generation::from(u32::MAX)
        );

        let r = f.call(TABLE, sel::INVALIDATE, [g, 1, 0, 0]);
        assert_eq!(r.exception(), None);
        assert_eq!(f.kernel.objects()[g as usize].generation, Generation::ZERO);
    }

    #[test]
    fn unknown_selectors_are_bad_operations() {
        let mut f = Fixture::boot(&[]);
        let r = f.call(TABLE, 9, [0; 4]);
        assert_eq!(r.exception(), Some(Exception::BadOperation));
        assert_eq!(r.data[2], 9);
    }

    proptest! {
        #[test]
        fn invalidated_keys_designate_null(
            brands in proptest::collection::vec(any::<u64>(), 1..8),
        ) {
            let mut f = Fixture::boot(&[ObjectDesc::gate()]);
            let g = Fixture::EXTRA;
            let keys: Vec<Key> = brands.iter().map(|b| f.mint(g, *b)).collect();
            for (k, b) in keys.iter().zip(&brands) {
                prop_assert_eq!(f.kernel.resolve(*k), (g, *b));
            }

            let r = f.call(TABLE, sel::INVALIDATE, [g, 0, 0, 0]);
            prop_assert_eq!(r.exception(), None);
            for k in &keys {
                prop_assert_eq!(f.kernel.resolve(*k), (well_known::NULL, 0));
            }
            let fresh = f.mint(g, 0);
            prop_assert_eq!(f.kernel.resolve(fresh), (g, 0));
        }
    }
}
