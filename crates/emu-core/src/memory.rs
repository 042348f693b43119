//! Flat linear memory view.
//!
//! The CPU does not own guest memory — per §1 the loader and memory-region
//! allocation are external collaborators — so [`Memory`] simply borrows a
//! byte slice for the lifetime of the emulation run. All accesses are
//! little-endian regardless of host endianness; the conversion helpers make
//! that explicit rather than relying on `u32::from_ne_bytes` silently doing
//! the right thing only on little-endian hosts.

use crate::error::{CpuError, FaultContext, Result};

pub struct Memory<'a> {
    bytes: &'a mut [u8],
    strict_bounds: bool,
}

impl<'a> Memory<'a> {
    pub fn new(bytes: &'a mut [u8], strict_bounds: bool) -> Self {
        Memory {
            bytes,
            strict_bounds,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn check_range(&self, addr: u64, len: usize, ctx_rip: u64) -> Result<()> {
        let end = addr.checked_add(len as u64);
        let in_bounds = matches!(end, Some(e) if e <= self.bytes.len() as u64);
        if !in_bounds {
            if self.strict_bounds {
                return Err(CpuError::BoundsViolation {
                    addr,
                    len,
                    mem_size: self.bytes.len(),
                    ctx: FaultContext {
                        rip: ctx_rip,
                        ..Default::default()
                    },
                });
            }
            // Release-mode: the spec explicitly allows release builds to
            // elide the check and let a faulty guest corrupt host memory
            // inside the allocated region, but never outside it, so we still
            // refuse to touch bytes past the end of the backing slice.
            return Err(CpuError::BoundsViolation {
                addr,
                len,
                mem_size: self.bytes.len(),
                ctx: FaultContext {
                    rip: ctx_rip,
                    ..Default::default()
                },
            });
        }
        Ok(())
    }

    pub fn read_bytes(&self, addr: u64, len: usize, ctx_rip: u64) -> Result<&[u8]> {
        self.check_range(addr, len, ctx_rip)?;
        Ok(&self.bytes[addr as usize..addr as usize + len])
    }

    pub fn write_bytes(&mut self, addr: u64, data: &[u8], ctx_rip: u64) -> Result<()> {
        self.check_range(addr, data.len(), ctx_rip)?;
        self.bytes[addr as usize..addr as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read_u8(&self, addr: u64, ctx_rip: u64) -> Result<u8> {
        Ok(self.read_bytes(addr, 1, ctx_rip)?[0])
    }

    pub fn write_u8(&mut self, addr: u64, v: u8, ctx_rip: u64) -> Result<()> {
        self.write_bytes(addr, &[v], ctx_rip)
    }

    pub fn read_u16(&self, addr: u64, ctx_rip: u64) -> Result<u16> {
        let b = self.read_bytes(addr, 2, ctx_rip)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn write_u16(&mut self, addr: u64, v: u16, ctx_rip: u64) -> Result<()> {
        self.write_bytes(addr, &v.to_le_bytes(), ctx_rip)
    }

    pub fn read_u32(&self, addr: u64, ctx_rip: u64) -> Result<u32> {
        let b = self.read_bytes(addr, 4, ctx_rip)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn write_u32(&mut self, addr: u64, v: u32, ctx_rip: u64) -> Result<()> {
        self.write_bytes(addr, &v.to_le_bytes(), ctx_rip)
    }

    pub fn read_u64(&self, addr: u64, ctx_rip: u64) -> Result<u64> {
        let b = self.read_bytes(addr, 8, ctx_rip)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    pub fn write_u64(&mut self, addr: u64, v: u64, ctx_rip: u64) -> Result<()> {
        self.write_bytes(addr, &v.to_le_bytes(), ctx_rip)
    }

    pub fn read_u128(&self, addr: u64, ctx_rip: u64) -> Result<u128> {
        let b = self.read_bytes(addr, 16, ctx_rip)?;
        let mut arr = [0u8; 16];
        arr.copy_from_slice(b);
        Ok(u128::from_le_bytes(arr))
    }

    pub fn write_u128(&mut self, addr: u64, v: u128, ctx_rip: u64) -> Result<()> {
        self.write_bytes(addr, &v.to_le_bytes(), ctx_rip)
    }

    /// 10-byte x87 extended-precision load/store; see [`crate::x87::F80`].
    pub fn read_f80_bytes(&self, addr: u64, ctx_rip: u64) -> Result<[u8; 10]> {
        let b = self.read_bytes(addr, 10, ctx_rip)?;
        let mut arr = [0u8; 10];
        arr.copy_from_slice(b);
        Ok(arr)
    }

    pub fn write_f80_bytes(&mut self, addr: u64, v: &[u8; 10], ctx_rip: u64) -> Result<()> {
        self.write_bytes(addr, v, ctx_rip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_width() {
        let mut backing = vec![0u8; 256];
        let mut mem = Memory::new(&mut backing, true);
        mem.write_u8(0, 0xab, 0).unwrap();
        assert_eq!(mem.read_u8(0, 0).unwrap(), 0xab);
        mem.write_u16(2, 0x1234, 0).unwrap();
        assert_eq!(mem.read_u16(2, 0).unwrap(), 0x1234);
        mem.write_u32(4, 0xdead_beef, 0).unwrap();
        assert_eq!(mem.read_u32(4, 0).unwrap(), 0xdead_beef);
        mem.write_u64(8, 0x0123_4567_89ab_cdef, 0).unwrap();
        assert_eq!(mem.read_u64(8, 0).unwrap(), 0x0123_4567_89ab_cdef);
        mem.write_u128(16, 0x1111_2222_3333_4444_5555_6666_7777_8888, 0)
            .unwrap();
        assert_eq!(
            mem.read_u128(16, 0).unwrap(),
            0x1111_2222_3333_4444_5555_6666_7777_8888
        );
    }

    #[test]
    fn little_endian_byte_order_is_explicit() {
        let mut backing = vec![0u8; 16];
        let mut mem = Memory::new(&mut backing, true);
        mem.write_u32(0, 0x0102_0304, 0).unwrap();
        assert_eq!(&backing[0..4], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let mut backing = vec![0u8; 4];
        let mem = Memory::new(&mut backing, true);
        assert!(mem.read_u64(0, 0).is_err());
    }
}
