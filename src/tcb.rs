//! The fixed-format 128-byte task-control-block record (`SPEC_FULL.md` §3,
//! §4.5.3, §6).
//!
//! The source driver models a TCB as a C union with named field macros; per
//! the design-note resolution this is a Rust sum type over
//! `{GridInit, GroupInit, Task}` with an explicit serializer writing each
//! variant into the fixed byte layout, rather than a punned union.

pub const TCB_SIZE: usize = 128;

/// Low nibble of `flag`: which of the three TCB shapes this record is.
pub const TASK_TYPE_MASK: u32 = 0xF;
pub const TASK_TYPE_GRID_INIT: u32 = 0x0;
pub const TASK_TYPE_GROUP_INIT: u32 = 0x1;
pub const TASK_TYPE_TASK: u32 = 0x2;

pub const L2D_FLUSH: u32 = 1 << 16;

pub const DEP_TYPE_SHIFT: u32 = 4;
pub const DEP_TYPE_MASK: u32 = 0b11 << DEP_TYPE_SHIFT;
pub const DEP_TYPE_NONE: u32 = 0b00 << DEP_TYPE_SHIFT;
pub const DEP_TYPE_GROUP: u32 = 0b01 << DEP_TYPE_SHIFT;
pub const DEP_TYPE_PRE_ALL: u32 = 0b10 << DEP_TYPE_SHIFT;

pub const END_TYPE_GROUP_END: u32 = 1 << 6;
pub const END_TYPE_GRID_END: u32 = 1 << 7;

pub const GRID_DONE: u32 = 1 << 0;
pub const GRID_GM_FAULT: u32 = 1 << 1;

pub const GM_REMAP_EN: u32 = 1 << 0;
pub const DDR_TO_GM: u32 = 1;

pub const EN_GROUP_DEPEND: u16 = 0x8000;
pub const GROUP_DEP_MASK: u16 = 0x7FFF;

pub const ASID_RD: u32 = 1 << 0;
pub const ASID_WR: u32 = 1 << 1;

pub const TEC_ALL: u32 = 0xFF;
pub const TEC_SIGNAL: u32 = 1 << 8;

fn asid_slot(base_pa: u64, perm: u32) -> u32 {
    (crate::util::lo(base_pa) & !0b11) | perm
}

/// Fields unique to the single `GRID_INIT` record that opens a chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct GridInitFields {
    pub group_num: u32,
    pub grid_interrupt_en: u32,
    pub grid_gridid: u16,
    pub grid_groupid: u16,
    pub gm_ctrl: Option<u32>,
    pub gm_addr: Option<u64>,
    pub gm_sync: Option<u32>,
}

/// Fields for one `GROUP_INIT` record, one per subgraph.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupInitFields {
    pub group_gridid: u16,
    pub group_groupid: u16,
    pub dep_type: u32,
    pub group_deps: [u16; 4],
    pub segmmu_ctrl: u32,
    /// Slots 0/1 = ASID0 base, slots 2/3 = the subgraph's weight ASID base,
    /// slots 4..7 unused (`SPEC_FULL.md` §4.5.3).
    pub asids: [u32; 8],
}

/// Fields for one `TASK` record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskFields {
    pub groupid: u16,
    pub gridid: u16,
    pub taskid: u8,
    pub spc: u64,
    pub ica_warmup_len: u32,
    pub grid_dim: [u16; 3],
    pub group_dim: [u16; 3],
    pub group_id: [u16; 3],
    pub task_id: [u16; 3],
    pub tcbp: u32,
    pub sp: u32,
    pub pp: u32,
    pub dp: u32,
    pub cp: u32,
    pub pprofiler: Option<u32>,
    pub pprint: Option<u32>,
    pub global_param: Option<u32>,
    pub interrupt_en: u32,
}

/// A tagged-union TCB record: `flag` plus the variant's fields.
#[derive(Debug, Clone, Copy)]
pub enum TcbRecord {
    GridInit { end_flags: u32, fields: GridInitFields },
    GroupInit { end_flags: u32, fields: GroupInitFields },
    Task { end_flags: u32, fields: TaskFields },
}

impl TcbRecord {
    pub fn task_type(&self) -> u32 {
        match self {
            TcbRecord::GridInit { .. } => TASK_TYPE_GRID_INIT,
            TcbRecord::GroupInit { .. } => TASK_TYPE_GROUP_INIT,
            TcbRecord::Task { .. } => TASK_TYPE_TASK,
        }
    }

    pub fn flag(&self) -> u32 {
        let end_flags = match self {
            TcbRecord::GridInit { end_flags, .. } => *end_flags,
            TcbRecord::GroupInit { end_flags, .. } => *end_flags,
            TcbRecord::Task { end_flags, .. } => *end_flags,
        };
        self.task_type() | end_flags
    }

    pub fn is_group_end(&self) -> bool {
        self.flag() & END_TYPE_GROUP_END != 0
    }

    pub fn is_grid_end(&self) -> bool {
        self.flag() & END_TYPE_GRID_END != 0
    }

    /// Serializes this record into a fixed 128-byte buffer. Field offsets
    /// within a variant are this driver's own byte layout choice (the spec
    /// only mandates the overall 128-byte size and the `flag` tag); see
    /// `DESIGN.md`.
    pub fn encode(&self) -> [u8; TCB_SIZE] {
        let mut buf = [0u8; TCB_SIZE];
        buf[0..4].copy_from_slice(&self.flag().to_le_bytes());

        match self {
            TcbRecord::GridInit { fields, .. } => {
                buf[4..8].copy_from_slice(&fields.group_num.to_le_bytes());
                buf[8..12].copy_from_slice(&fields.grid_interrupt_en.to_le_bytes());
                buf[12..14].copy_from_slice(&fields.grid_gridid.to_le_bytes());
                buf[14..16].copy_from_slice(&fields.grid_groupid.to_le_bytes());
                if let Some(gm_ctrl) = fields.gm_ctrl {
                    buf[16..20].copy_from_slice(&gm_ctrl.to_le_bytes());
                }
                if let Some(gm_addr) = fields.gm_addr {
                    buf[20..24].copy_from_slice(&crate::util::lo(gm_addr).to_le_bytes());
                    buf[24..28].copy_from_slice(&crate::util::hi(gm_addr).to_le_bytes());
                }
                if let Some(gm_sync) = fields.gm_sync {
                    buf[28..32].copy_from_slice(&gm_sync.to_le_bytes());
                }
            }
            TcbRecord::GroupInit { fields, .. } => {
                buf[4..6].copy_from_slice(&fields.group_gridid.to_le_bytes());
                buf[6..8].copy_from_slice(&fields.group_groupid.to_le_bytes());
                for (i, dep) in fields.group_deps.iter().enumerate() {
                    buf[8 + i * 2..10 + i * 2].copy_from_slice(&dep.to_le_bytes());
                }
                buf[16..20].copy_from_slice(&fields.segmmu_ctrl.to_le_bytes());
                for (i, asid) in fields.asids.iter().enumerate() {
                    let at = 24 + i * 4;
                    buf[at..at + 4].copy_from_slice(&asid.to_le_bytes());
                }
            }
            TcbRecord::Task { fields, .. } => {
                buf[4..6].copy_from_slice(&fields.groupid.to_le_bytes());
                buf[6..8].copy_from_slice(&fields.gridid.to_le_bytes());
                buf[8] = fields.taskid;
                buf[12..16].copy_from_slice(&fields.ica_warmup_len.to_le_bytes());
                encode_dim3(&mut buf[16..22], &fields.grid_dim);
                encode_dim3(&mut buf[22..28], &fields.group_dim);
                encode_dim3(&mut buf[28..34], &fields.group_id);
                encode_dim3(&mut buf[34..40], &fields.task_id);
                buf[40..44].copy_from_slice(&fields.tcbp.to_le_bytes());
                buf[48..56].copy_from_slice(&fields.spc.to_le_bytes());
                buf[56..60].copy_from_slice(&fields.sp.to_le_bytes());
                buf[60..64].copy_from_slice(&fields.pp.to_le_bytes());
                buf[64..68].copy_from_slice(&fields.dp.to_le_bytes());
                buf[68..72].copy_from_slice(&fields.cp.to_le_bytes());
                if let Some(v) = fields.pprofiler {
                    buf[72..76].copy_from_slice(&v.to_le_bytes());
                }
                if let Some(v) = fields.pprint {
                    buf[76..80].copy_from_slice(&v.to_le_bytes());
                }
                if let Some(v) = fields.global_param {
                    buf[80..84].copy_from_slice(&v.to_le_bytes());
                }
                buf[84..88].copy_from_slice(&fields.interrupt_en.to_le_bytes());
            }
        }

        buf
    }
}

impl std::fmt::Display for TcbRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TcbRecord::GridInit { fields, .. } => f
                .debug_struct("TCB(GRID_INIT)")
                .field("grid", &fields.grid_gridid)
                .field("group_num", &fields.group_num)
                .finish(),
            TcbRecord::GroupInit { fields, .. } => f
                .debug_struct("TCB(GROUP_INIT)")
                .field("grid", &fields.group_gridid)
                .field("group", &fields.group_groupid)
                .field("dep_type", &format_args!("{:#x}", fields.dep_type))
                .finish(),
            TcbRecord::Task { fields, .. } => f
                .debug_struct("TCB(TASK)")
                .field("grid", &fields.gridid)
                .field("group", &fields.groupid)
                .field("task", &fields.taskid)
                .finish(),
        }
    }
}

fn encode_dim3(out: &mut [u8], dims: &[u16; 3]) {
    for (i, d) in dims.iter().enumerate() {
        out[i * 2..i * 2 + 2].copy_from_slice(&d.to_le_bytes());
    }
}

/// Builds an ASID slot value for a GROUP_INIT record (`SPEC_FULL.md`
/// §4.5.3: "slot 0/1 = ASID0 base with RD|WR").
pub fn rdwr_asid_slot(base_pa: u64) -> u32 {
    asid_slot(base_pa, ASID_RD | ASID_WR)
}
