//! Shared binary-encoding helpers for the black-box end-to-end tests.
//!
//! Mirrors the `minimal_binary`/`section_entry` helpers in
//! `src/binary/mod.rs`'s own unit tests, extended to also encode a `.bss`
//! bucket and a `.dcr` subgraph table, since these tests exercise the crate
//! the way an external caller would: through `binary::parse` and
//! `Graph::load`, never by touching a crate-internal field directly.

use npu_umd::binary::Header;

const SECTION_ENTRY_LEN: usize = 16 + 4 + 4;

pub struct TensorSpec {
    pub id: u32,
    pub size: u32,
    pub data_type_code: u32,
    pub ro_offsets: Vec<u32>,
}

impl TensorSpec {
    pub fn new(id: u32, size: u32) -> TensorSpec {
        TensorSpec { id, size, data_type_code: 8 /* F32 */, ro_offsets: Vec::new() }
    }

    pub fn with_reloc(mut self, ro_offset: u32) -> TensorSpec {
        self.ro_offsets.push(ro_offset);
        self
    }
}

pub enum PrecursorSpec {
    None,
    PreAll,
    Explicit(Vec<i32>),
}

pub struct SubgraphSpec {
    pub text_offset: u32,
    pub precursors: PrecursorSpec,
    pub private_buffer_size: u32,
}

impl SubgraphSpec {
    pub fn new(text_offset: u32) -> SubgraphSpec {
        SubgraphSpec { text_offset, precursors: PrecursorSpec::None, private_buffer_size: 0 }
    }

    pub fn precursors(mut self, p: PrecursorSpec) -> SubgraphSpec {
        self.precursors = p;
        self
    }

    pub fn private_buffer(mut self, size: u32) -> SubgraphSpec {
        self.private_buffer_size = size;
        self
    }
}

#[derive(Default)]
pub struct GraphSpec {
    pub subgraphs: Vec<SubgraphSpec>,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    pub outputs_shape: Vec<TensorSpec>,
    pub text_len: u32,
    pub rodata_len: u32,
    pub globalparam_len: u32,
}

fn sub_section_bytes(kind: u32, spec: &TensorSpec) -> Vec<u8> {
    let mut b = Vec::new();
    b.extend_from_slice(&kind.to_le_bytes());
    b.extend_from_slice(&spec.size.to_le_bytes());
    b.extend_from_slice(&spec.id.to_le_bytes());
    b.extend_from_slice(&0u32.to_le_bytes()); // offset_in_section_exec
    b.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // addr_mask
    b.extend_from_slice(&(spec.ro_offsets.len() as u32).to_le_bytes());
    b.extend_from_slice(&1.0f32.to_bits().to_le_bytes()); // scale
    b.extend_from_slice(&0i32.to_le_bytes()); // zero_point
    b.extend_from_slice(&spec.data_type_code.to_le_bytes());
    for off in &spec.ro_offsets {
        b.extend_from_slice(&off.to_le_bytes());
    }
    b
}

fn reuse_section_bytes(size: u32, sub: Vec<u8>) -> Vec<u8> {
    let mut b = Vec::new();
    b.extend_from_slice(&size.to_le_bytes());
    b.extend_from_slice(&64u32.to_le_bytes()); // align
    b.extend_from_slice(&0u32.to_le_bytes()); // offset_in_file (unused for reuse)
    b.extend_from_slice(&1u32.to_le_bytes()); // sub_section_cnt
    b.extend_from_slice(&sub);
    b
}

/// Encodes one `.bss` bucket: no static sections, one reuse section per
/// input/output/output-shape tensor, in that order.
fn bss_bytes(spec: &GraphSpec) -> Vec<u8> {
    let mut b = Vec::new();
    b.extend_from_slice(&4096u32.to_le_bytes()); // stack_size
    b.extend_from_slice(&16u32.to_le_bytes()); // stack_align
    b.extend_from_slice(&0u32.to_le_bytes()); // static_count
    let reuse_count = spec.inputs.len() + spec.outputs.len() + spec.outputs_shape.len();
    b.extend_from_slice(&(reuse_count as u32).to_le_bytes());

    for t in &spec.inputs {
        b.extend_from_slice(&reuse_section_bytes(t.size, sub_section_bytes(2, t)));
    }
    for t in &spec.outputs {
        b.extend_from_slice(&reuse_section_bytes(t.size, sub_section_bytes(3, t)));
    }
    for t in &spec.outputs_shape {
        b.extend_from_slice(&reuse_section_bytes(t.size, sub_section_bytes(10, t)));
    }
    b
}

/// Encodes the `.dcr` subgraph table.
fn dcr_bytes(spec: &GraphSpec) -> Vec<u8> {
    let mut b = Vec::new();
    b.extend_from_slice(&(spec.subgraphs.len() as u32).to_le_bytes());
    for (i, sg) in spec.subgraphs.iter().enumerate() {
        b.extend_from_slice(&(i as u32).to_le_bytes()); // id
        b.extend_from_slice(&0u32.to_le_bytes()); // bss_idx
        b.extend_from_slice(&sg.text_offset.to_le_bytes());
        b.extend_from_slice(&64u32.to_le_bytes()); // text_size
        b.extend_from_slice(&0u32.to_le_bytes()); // printfifo_size
        b.extend_from_slice(&0u32.to_le_bytes()); // profiler_buf_size
        b.extend_from_slice(&0u32.to_le_bytes()); // private_data_size
        b.extend_from_slice(&0u32.to_le_bytes()); // warmup_len

        let (precursor_cnt, raw): (i32, [i32; 4]) = match &sg.precursors {
            PrecursorSpec::None => (0, [0; 4]),
            PrecursorSpec::PreAll => (-1, [0; 4]),
            PrecursorSpec::Explicit(ps) => {
                let mut raw = [0i32; 4];
                for (i, &p) in ps.iter().enumerate() {
                    raw[i] = p;
                }
                (ps.len() as i32, raw)
            }
        };
        b.extend_from_slice(&precursor_cnt.to_le_bytes());
        for p in raw {
            b.extend_from_slice(&p.to_le_bytes());
        }

        let private_buffer_cnt = if sg.private_buffer_size > 0 { 1u32 } else { 0u32 };
        b.extend_from_slice(&private_buffer_cnt.to_le_bytes());
        if sg.private_buffer_size > 0 {
            b.extend_from_slice(&sg.private_buffer_size.to_le_bytes()); // size
            b.extend_from_slice(&64u32.to_le_bytes()); // align_in_page
            b.extend_from_slice(&0u32.to_le_bytes()); // private_buffers_map[0]
        }
    }
    b
}

fn section_entry(name: &str, offset: u32, size: u32) -> Vec<u8> {
    let mut buf = vec![0u8; SECTION_ENTRY_LEN];
    buf[..name.len()].copy_from_slice(name.as_bytes());
    buf[16..20].copy_from_slice(&offset.to_le_bytes());
    buf[20..24].copy_from_slice(&size.to_le_bytes());
    buf
}

/// Assembles a complete graph binary (`.text`, `.rodata`, `.dcr`, `.bss`,
/// and optionally `.note.aipu.globalparam`) and loads it the way a real
/// caller would: `binary::parse` then `Graph::load`.
pub fn build_graph(spec: GraphSpec) -> npu_umd::Graph {
    let dcr = dcr_bytes(&spec);
    let bss = bss_bytes(&spec);

    let want_globalparam = spec.globalparam_len > 0;
    let mut names: Vec<(&str, u32)> = vec![
        (".text", spec.text_len.max(1)),
        (".rodata", spec.rodata_len.max(1)),
        (".dcr", dcr.len() as u32),
        (".bss", bss.len() as u32),
    ];
    if want_globalparam {
        names.push((".note.aipu.globalparam", spec.globalparam_len));
    }

    let header_size = Header::ENCODED_LEN as u32 + 4 + names.len() as u32 * SECTION_ENTRY_LEN as u32;
    let mut offsets = Vec::with_capacity(names.len());
    let mut cursor = header_size;
    for &(_, size) in &names {
        offsets.push(cursor);
        cursor += size;
    }
    let file_size = cursor;

    let mut data = vec![0u8; file_size as usize];
    data[0..8].copy_from_slice(b"AIPU_NN\0");
    data[8..12].copy_from_slice(&0u32.to_le_bytes()); // device
    data[12..16].copy_from_slice(&(0x05u32 << 24).to_le_bytes()); // version
    data[16..20].copy_from_slice(&0u32.to_le_bytes()); // build_version
    data[20..24].copy_from_slice(&header_size.to_le_bytes());
    data[24..28].copy_from_slice(&file_size.to_le_bytes());
    data[28..32].copy_from_slice(&0u32.to_le_bytes()); // type
    data[32..36].copy_from_slice(&0u32.to_le_bytes()); // flag

    let table_start = Header::ENCODED_LEN;
    data[table_start..table_start + 4].copy_from_slice(&(names.len() as u32).to_le_bytes());
    let mut entry_cursor = table_start + 4;
    for (i, &(name, size)) in names.iter().enumerate() {
        let entry = section_entry(name, offsets[i], size);
        data[entry_cursor..entry_cursor + SECTION_ENTRY_LEN].copy_from_slice(&entry);
        entry_cursor += SECTION_ENTRY_LEN;
    }

    for (i, &(name, _)) in names.iter().enumerate() {
        let at = offsets[i] as usize;
        match name {
            ".dcr" => data[at..at + dcr.len()].copy_from_slice(&dcr),
            ".bss" => data[at..at + bss.len()].copy_from_slice(&bss),
            _ => {}
        }
    }

    let raw = npu_umd::binary::parse(data).expect("well-formed test binary parses");
    npu_umd::Graph::load(raw, &[0]).expect("single-bucket graph loads")
}
