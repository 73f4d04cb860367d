pub const NCPU: usize = 8;

pub const MAXOPBLOCKS: usize = 10; // max # of blocks any FS op writes
pub const NBUF: usize = MAXOPBLOCKS * 3; // size of disk block cache
pub const NBUCKET: usize = 13; // buffer cache hash buckets; prime, so block runs spread out
pub const BSIZE: usize = 4096; // size of disk block
pub const PGSIZE: usize = 4096; // bytes per physical page
