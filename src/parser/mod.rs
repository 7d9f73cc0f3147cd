//! BSS/remap walking and I/O ordering (`SPEC_FULL.md` §4.2).

mod cursor;

use crate::binary::BinError;
use crate::graph::types::{
    BssBucket, DataType, GmConfig, IoList, IoTensorDescriptor, LoadType, ParamRelocEntry,
    RemapEntry, SectionDescriptor, SectionKind, SegMmuConfig, SubSectionDescriptor,
};
use crate::util::align_up;
use cursor::Cursor;

/// Running placement state for the const/zero-copy-const buckets a static
/// section lands in (`SPEC_FULL.md` §4.2: "emit a section descriptor placed
/// at running `const_start` (or `zerocpy_const_start`) aligned to its own
/// alignment").
#[derive(Default)]
struct Placement {
    const_start: u32,
    zerocpy_const_start: u32,
    reuse_start: u32,
}

/// Walks one BSS bucket's bytes into a [`BssBucket`] plus its subgraphs'
/// relocation entries. `bss_id` is only used for diagnostics.
pub fn parse_bss_section(bytes: &[u8], _bss_id: usize) -> Result<BssBucket, BinError> {
    let mut cur = Cursor::new(bytes);

    let stack_size = cur.u32()?;
    let stack_align = cur.u32()?;
    let static_count = cur.u32()? as usize;
    let reuse_count = cur.u32()? as usize;

    let mut bucket = BssBucket {
        stack_size,
        stack_align,
        ..Default::default()
    };
    let mut placement = Placement::default();

    for slot_index in 0..static_count {
        let desc = parse_section_desc(&mut cur, slot_index, true, &mut placement)?;
        for (sub_index, sub) in desc.sub_sections.iter().enumerate() {
            for &offset_in_ro in &sub.offsets_in_ro {
                bucket.reloc_entries.push(ParamRelocEntry {
                    offset_in_ro,
                    load_type: LoadType::Static,
                    sub_type: sub.kind,
                    buf_index: slot_index,
                    sub_index,
                    offset_in_section: sub.offset_in_section_exec,
                    addr_mask: sub.addr_mask,
                });
            }
        }
        if desc.kind == SectionKind::ZeroCopyConst {
            bucket.zerocpy_const_sections.push(desc);
        } else {
            bucket.const_sections.push(desc);
        }
    }

    for slot_index in 0..reuse_count {
        let desc = parse_section_desc(&mut cur, slot_index, false, &mut placement)?;
        for (sub_index, sub) in desc.sub_sections.iter().enumerate() {
            if let Some(list) = sub.kind.io_list() {
                let tensor = IoTensorDescriptor {
                    id: sub.id,
                    size: sub.size,
                    ref_section_iter: slot_index,
                    offset_in_section: sub.offset_in_section_exec,
                    scale: sub.scale,
                    zero_point: sub.zero_point,
                    data_type: sub.data_type,
                };
                match list {
                    IoList::Inputs => bucket.io.inputs.push(tensor),
                    IoList::Outputs => bucket.io.outputs.push(tensor),
                    IoList::InterDumps => bucket.io.inter_dumps.push(tensor),
                    IoList::OutputsShape => bucket.io.outputs_shape.push(tensor),
                }
            }
            for &offset_in_ro in &sub.offsets_in_ro {
                bucket.reloc_entries.push(ParamRelocEntry {
                    offset_in_ro,
                    load_type: LoadType::Reuse,
                    sub_type: sub.kind,
                    buf_index: slot_index,
                    sub_index,
                    offset_in_section: sub.offset_in_section_exec,
                    addr_mask: sub.addr_mask,
                });
            }
        }
        bucket.reuse_sections.push(desc);
    }

    sort_io(&mut bucket.io.inputs)?;
    sort_io(&mut bucket.io.outputs)?;
    sort_io(&mut bucket.io.inter_dumps)?;
    sort_io(&mut bucket.io.outputs_shape)?;

    Ok(bucket)
}

fn parse_section_desc(
    cur: &mut Cursor,
    slot_index: usize,
    is_static: bool,
    placement: &mut Placement,
) -> Result<SectionDescriptor, BinError> {
    let size = cur.u32()?;
    let align_bytes = cur.u32()?;
    let offset_in_file = cur.u32()?;
    let sub_section_cnt = cur.u32()? as usize;

    let mut sub_sections = Vec::with_capacity(sub_section_cnt);
    let mut kind = if is_static { SectionKind::StaticWeight } else { SectionKind::ReuseInput };
    for _ in 0..sub_section_cnt {
        let sub = parse_sub_section_desc(cur)?;
        kind = sub.kind;
        sub_sections.push(sub);
    }

    let relative_addr = if is_static {
        let bucket_start = if kind == SectionKind::ZeroCopyConst {
            &mut placement.zerocpy_const_start
        } else {
            &mut placement.const_start
        };
        let addr = align_up(*bucket_start as u64, align_bytes.max(1) as u64) as u32;
        *bucket_start = addr + size;
        addr
    } else {
        let addr = align_up(placement.reuse_start as u64, align_bytes.max(1) as u64) as u32;
        placement.reuse_start = addr + size;
        addr
    };

    Ok(SectionDescriptor {
        size,
        align_in_page: align_bytes,
        offset_in_file,
        kind,
        relative_addr,
        load_src: if is_static { Some(offset_in_file) } else { None },
        sub_sections,
        slot_index,
    })
}

fn parse_sub_section_desc(cur: &mut Cursor) -> Result<SubSectionDescriptor, BinError> {
    let type_code = cur.u32()?;
    let kind = SectionKind::from_code(type_code)
        .ok_or_else(|| BinError::InvalidBin(format!("unknown sub-section type {type_code}")))?;
    let size = cur.u32()?;
    let id = cur.u32()?;
    let offset_in_section_exec = cur.u32()?;
    let addr_mask = cur.u32()?;
    let offset_in_ro_cnt = cur.u32()? as usize;
    let scale = cur.f32()?;
    let zero_point = cur.i32()?;
    let data_type_code = cur.u32()?;
    let data_type = DataType::from_code(data_type_code)
        .ok_or_else(|| BinError::InvalidBin(format!("unknown data type {data_type_code}")))?;

    let mut offsets_in_ro = Vec::with_capacity(offset_in_ro_cnt);
    for _ in 0..offset_in_ro_cnt {
        offsets_in_ro.push(cur.u32()?);
    }

    Ok(SubSectionDescriptor {
        kind,
        size,
        id,
        offset_in_section_exec,
        addr_mask,
        scale,
        zero_point,
        data_type,
        offsets_in_ro,
    })
}

/// Enforces compiler-declared tensor order: after sorting, `tensors[i].id ==
/// i` for every `i` (`SPEC_FULL.md` §4.2, testable property 1).
pub fn sort_io(tensors: &mut Vec<IoTensorDescriptor>) -> Result<(), BinError> {
    let len = tensors.len();
    for tensor in tensors.iter() {
        if tensor.id as usize >= len {
            return Err(BinError::InvalidBin(format!(
                "io tensor id {} out of range for list of length {len}",
                tensor.id
            )));
        }
    }
    tensors.sort_by_key(|t| t.id);
    for (i, tensor) in tensors.iter().enumerate() {
        debug_assert_eq!(tensor.id as usize, i);
    }
    Ok(())
}

/// Reads a `.remap` section: a count followed by that many entries
/// (`SPEC_FULL.md` §4.2 `parse_remap_section`).
pub fn parse_remap_section(bytes: &[u8]) -> Result<Vec<RemapEntry>, BinError> {
    let mut cur = Cursor::new(bytes);
    let count = cur.u32()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(RemapEntry {
            src_offset: cur.u32()?,
            dst_offset: cur.u32()?,
            size: cur.u32()?,
        });
    }
    Ok(entries)
}

/// Reads a `.note.aipu.gmconfig` section: `size: u64`, `remap_en: u32`
/// (bool), `initial_sync: u32` (bool) (`SPEC_FULL.md` §4.1/§4.5.3).
pub fn parse_gmconfig_section(bytes: &[u8]) -> Result<GmConfig, BinError> {
    let mut cur = Cursor::new(bytes);
    Ok(GmConfig {
        size: cur.u64()?,
        remap_en: cur.u32()? != 0,
        initial_sync: cur.u32()? != 0,
    })
}

/// Reads a `.note.aipu.segmmu` section: a `num` field (`SPEC_FULL.md` §4.5.4:
/// "0 means skip, 1 means every core shares one config, otherwise one config
/// per core") followed by `max(num, 1)` flattened
/// `seg[4].control[2]` blocks. `num == 0` yields an empty list.
pub fn parse_segmmu_section(bytes: &[u8]) -> Result<Vec<SegMmuConfig>, BinError> {
    let mut cur = Cursor::new(bytes);
    let num = cur.u32()?;
    if num == 0 {
        return Ok(Vec::new());
    }

    let count = num.max(1) as usize;
    let mut configs = Vec::with_capacity(count);
    for _ in 0..count {
        let mut cfg = SegMmuConfig::new(num);
        for slot in cfg.seg_control.iter_mut() {
            *slot = cur.u32()?;
        }
        configs.push(cfg);
    }
    Ok(configs)
}

/// Reads the subgraph table (stored in `.dcr`, one entry per subgraph).
/// `SPEC_FULL.md` §6 only specifies the BSS and remap wire formats in
/// detail; this layout is this driver's own choice for serializing the
/// graph's subgraph list and is documented as such in `DESIGN.md`.
pub fn parse_subgraph_table(bytes: &[u8]) -> Result<Vec<crate::graph::types::Subgraph>, BinError> {
    use crate::graph::types::{PrivateBufferSpec, Precursors, Subgraph};

    let mut cur = Cursor::new(bytes);
    let count = cur.u32()? as usize;
    let mut subgraphs = Vec::with_capacity(count);

    for _ in 0..count {
        let id = cur.u32()?;
        let bss_idx = cur.u32()? as usize;
        let text_offset = cur.u32()?;
        let text_size = cur.u32()?;
        let printfifo_size = cur.u32()?;
        let profiler_buf_size = cur.u32()?;
        let private_data_size = cur.u32()?;
        let warmup_len = cur.u32()?;

        let precursor_cnt = cur.i32()?;
        let mut raw_precursors = [0i32; 4];
        for slot in raw_precursors.iter_mut() {
            *slot = cur.i32()?;
        }
        let precursors = match precursor_cnt {
            0 => Precursors::None,
            -1 => Precursors::PreAll,
            1..=4 => Precursors::Explicit(raw_precursors, precursor_cnt as usize),
            other => {
                return Err(BinError::InvalidBin(format!(
                    "invalid precursor_cnt {other} for subgraph {id}"
                )))
            }
        };

        let private_buffer_cnt = cur.u32()? as usize;
        let mut private_buffers = Vec::with_capacity(private_buffer_cnt);
        for _ in 0..private_buffer_cnt {
            private_buffers.push(PrivateBufferSpec {
                size: cur.u32()?,
                align_in_page: cur.u32()?,
            });
        }
        let mut private_buffers_map = Vec::with_capacity(private_buffer_cnt);
        for _ in 0..private_buffer_cnt {
            private_buffers_map.push(cur.u32()?);
        }

        subgraphs.push(Subgraph {
            id,
            bss_idx,
            text_offset,
            text_size,
            printfifo_size,
            profiler_buf_size,
            private_data_size,
            warmup_len,
            precursors,
            private_buffers,
            private_buffers_map,
        });
    }

    Ok(subgraphs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::types::IoTensorDescriptor;

    fn tensor(id: u32) -> IoTensorDescriptor {
        IoTensorDescriptor {
            id,
            size: 4,
            ref_section_iter: 0,
            offset_in_section: 0,
            scale: 1.0,
            zero_point: 0,
            data_type: DataType::F32,
        }
    }

    #[test]
    fn sort_io_is_identity_after_sort() {
        let mut tensors = vec![tensor(2), tensor(0), tensor(1)];
        sort_io(&mut tensors).unwrap();
        for (i, t) in tensors.iter().enumerate() {
            assert_eq!(t.id as usize, i);
        }
    }

    #[test]
    fn sort_io_rejects_out_of_range_id() {
        let mut tensors = vec![tensor(0), tensor(5)];
        let err = sort_io(&mut tensors).unwrap_err();
        assert!(matches!(err, BinError::InvalidBin(_)));
    }

    #[test]
    fn parse_remap_section_reads_entries() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&5u32.to_le_bytes());
        bytes.extend_from_slice(&6u32.to_le_bytes());

        let entries = parse_remap_section(&bytes).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].src_offset, 1);
        assert_eq!(entries[1].size, 6);
    }

    #[test]
    fn parse_remap_section_truncated_is_invalid_bin() {
        let bytes = 3u32.to_le_bytes().to_vec(); // count says 3 entries, none follow
        let err = parse_remap_section(&bytes).unwrap_err();
        assert!(matches!(err, BinError::InvalidBin(_)));
    }

    fn sub_section_bytes(kind: u32, size: u32, id: u32, ro_offsets: &[u32]) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&kind.to_le_bytes());
        b.extend_from_slice(&size.to_le_bytes());
        b.extend_from_slice(&id.to_le_bytes());
        b.extend_from_slice(&0u32.to_le_bytes()); // offset_in_section_exec
        b.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // addr_mask
        b.extend_from_slice(&(ro_offsets.len() as u32).to_le_bytes());
        b.extend_from_slice(&1.0f32.to_bits().to_le_bytes()); // scale
        b.extend_from_slice(&0i32.to_le_bytes()); // zero_point
        b.extend_from_slice(&8u32.to_le_bytes()); // data_type = F32
        for off in ro_offsets {
            b.extend_from_slice(&off.to_le_bytes());
        }
        b
    }

    fn section_bytes(size: u32, align: u32, offset_in_file: u32, subs: &[Vec<u8>]) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&size.to_le_bytes());
        b.extend_from_slice(&align.to_le_bytes());
        b.extend_from_slice(&offset_in_file.to_le_bytes());
        b.extend_from_slice(&(subs.len() as u32).to_le_bytes());
        for s in subs {
            b.extend_from_slice(s);
        }
        b
    }

    #[test]
    fn parse_bss_section_builds_reloc_entries_and_io_lists() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4096u32.to_le_bytes()); // stack_size
        bytes.extend_from_slice(&16u32.to_le_bytes()); // stack_align
        bytes.extend_from_slice(&1u32.to_le_bytes()); // static_count
        bytes.extend_from_slice(&1u32.to_le_bytes()); // reuse_count

        // One static weight section with one relocation target.
        let static_sub = sub_section_bytes(0, 64, 0, &[8]);
        bytes.extend_from_slice(&section_bytes(64, 64, 0, &[static_sub]));

        // One reuse section holding input tensor id 0.
        let reuse_sub = sub_section_bytes(2, 32, 0, &[16]);
        bytes.extend_from_slice(&section_bytes(32, 64, 0, &[reuse_sub]));

        let bucket = parse_bss_section(&bytes, 0).unwrap();
        assert_eq!(bucket.stack_size, 4096);
        assert_eq!(bucket.const_sections.len(), 1);
        assert_eq!(bucket.reuse_sections.len(), 1);
        assert_eq!(bucket.io.inputs.len(), 1);
        assert_eq!(bucket.io.inputs[0].id, 0);
        assert_eq!(bucket.reloc_entries.len(), 2);
        assert_eq!(bucket.reloc_entries[0].load_type, LoadType::Static);
        assert_eq!(bucket.reloc_entries[1].load_type, LoadType::Reuse);
    }

    #[test]
    fn parse_gmconfig_section_reads_size_and_flags() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(1u64 << 20).to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes()); // remap_en
        bytes.extend_from_slice(&0u32.to_le_bytes()); // initial_sync

        let cfg = parse_gmconfig_section(&bytes).unwrap();
        assert_eq!(cfg.size, 1 << 20);
        assert!(cfg.remap_en);
        assert!(!cfg.initial_sync);
    }

    #[test]
    fn parse_segmmu_section_num_zero_is_empty() {
        let bytes = 0u32.to_le_bytes().to_vec();
        let configs = parse_segmmu_section(&bytes).unwrap();
        assert!(configs.is_empty());
    }

    #[test]
    fn parse_segmmu_section_num_one_yields_single_shared_config() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        for _ in 0..(SegMmuConfig::SEGS * SegMmuConfig::CTRLS) {
            bytes.extend_from_slice(&0u32.to_le_bytes());
        }
        let configs = parse_segmmu_section(&bytes).unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].num, 1);
    }

    #[test]
    fn parse_segmmu_section_num_n_yields_n_per_core_configs() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&3u32.to_le_bytes());
        for core in 0..3u32 {
            for slot in 0..(SegMmuConfig::SEGS * SegMmuConfig::CTRLS) as u32 {
                bytes.extend_from_slice(&(core * 100 + slot).to_le_bytes());
            }
        }
        let configs = parse_segmmu_section(&bytes).unwrap();
        assert_eq!(configs.len(), 3);
        assert_eq!(configs[1].control(0, 0), 100);
        assert_eq!(configs[2].control(0, 1), 201);
    }

    #[test]
    fn parse_subgraph_table_reads_pre_all_and_explicit_deps() {
        use crate::graph::types::Precursors;

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_le_bytes()); // count

        // Subgraph 0: no precursors, no private buffers.
        bytes.extend_from_slice(&0u32.to_le_bytes()); // id
        bytes.extend_from_slice(&0u32.to_le_bytes()); // bss_idx
        bytes.extend_from_slice(&0u32.to_le_bytes()); // text_offset
        bytes.extend_from_slice(&64u32.to_le_bytes()); // text_size
        bytes.extend_from_slice(&0u32.to_le_bytes()); // printfifo_size
        bytes.extend_from_slice(&0u32.to_le_bytes()); // profiler_buf_size
        bytes.extend_from_slice(&0u32.to_le_bytes()); // private_data_size
        bytes.extend_from_slice(&0u32.to_le_bytes()); // warmup_len
        bytes.extend_from_slice(&0i32.to_le_bytes()); // precursor_cnt = NONE
        for _ in 0..4 {
            bytes.extend_from_slice(&0i32.to_le_bytes());
        }
        bytes.extend_from_slice(&0u32.to_le_bytes()); // private_buffer_cnt

        // Subgraph 1: PRE_ALL.
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&64u32.to_le_bytes());
        bytes.extend_from_slice(&64u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&(-1i32).to_le_bytes()); // precursor_cnt = PRE_ALL
        for _ in 0..4 {
            bytes.extend_from_slice(&0i32.to_le_bytes());
        }
        bytes.extend_from_slice(&0u32.to_le_bytes());

        let subgraphs = parse_subgraph_table(&bytes).unwrap();
        assert_eq!(subgraphs.len(), 2);
        assert_eq!(subgraphs[0].precursors, Precursors::None);
        assert_eq!(subgraphs[1].precursors, Precursors::PreAll);
    }
}
