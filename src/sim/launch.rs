use std::cell::RefCell;
use std::collections::HashMap;
use std::mem;

use bytemuck::Pod;

use super::SimArg;

/// View of one simulated dispatch, handed to a registered kernel body.
pub struct SimLaunch<'a> {
    global: &'a [usize],
    local: Option<&'a [usize]>,
    args: &'a [SimArg],
    memory: &'a RefCell<HashMap<u64, Vec<u8>>>,
    source: &'a str,
}

impl<'a> SimLaunch<'a> {
    pub(crate) fn new(
        global: &'a [usize],
        local: Option<&'a [usize]>,
        args: &'a [SimArg],
        memory: &'a RefCell<HashMap<u64, Vec<u8>>>,
        source: &'a str,
    ) -> Self {
        Self {
            global,
            local,
            args,
            memory,
            source,
        }
    }

    pub fn global_size(&self, dim: usize) -> usize {
        self.global.get(dim).copied().unwrap_or(1)
    }

    pub fn local_size(&self, dim: usize) -> Option<usize> {
        self.local.and_then(|l| l.get(dim).copied())
    }

    /// Total number of work items.
    pub fn work_items(&self) -> usize {
        self.global.iter().product()
    }

    /// The program text the kernel was built from, define prefix included.
    pub fn source(&self) -> &str {
        self.source
    }

    /// Value of `#define name value` in the built source. A bare define
    /// yields an empty string.
    pub fn define(&self, name: &str) -> Option<&str> {
        self.source.lines().find_map(|line| {
            let rest = line.trim_start().strip_prefix("#define")?;
            let rest = rest.trim_start();
            let value = rest.strip_prefix(name)?;
            if value.is_empty() || value.starts_with(char::is_whitespace) {
                Some(value.trim())
            } else {
                None
            }
        })
    }

    fn arg(&self, index: usize) -> Result<&SimArg, String> {
        self.args
            .get(index)
            .ok_or_else(|| format!("kernel has no argument {index}"))
    }

    pub fn scalar<T: Pod>(&self, index: usize) -> Result<T, String> {
        match self.arg(index)? {
            SimArg::Bytes(bytes) if bytes.len() >= mem::size_of::<T>() => {
                Ok(bytemuck::pod_read_unaligned(&bytes[..mem::size_of::<T>()]))
            }
            _ => Err(format!("argument {index} is not a {}-byte scalar", mem::size_of::<T>())),
        }
    }

    /// Byte size of a `__local` argument.
    pub fn local_bytes(&self, index: usize) -> Result<usize, String> {
        match self.arg(index)? {
            SimArg::Local(n) => Ok(*n),
            _ => Err(format!("argument {index} is not __local")),
        }
    }

    fn mem_id(&self, index: usize) -> Result<u64, String> {
        match self.arg(index)? {
            SimArg::Mem(id) => Ok(*id),
            _ => Err(format!("argument {index} is not a buffer")),
        }
    }

    /// Contents of a buffer argument.
    pub fn read<T: Pod>(&self, index: usize) -> Result<Vec<T>, String> {
        let id = self.mem_id(index)?;
        let memory = self.memory.borrow();
        let bytes = memory
            .get(&id)
            .ok_or_else(|| format!("buffer argument {index} was released"))?;
        let width = mem::size_of::<T>().max(1);
        let mut out = vec![T::zeroed(); bytes.len() / width];
        let dst: &mut [u8] = bytemuck::cast_slice_mut(&mut out);
        let len = dst.len();
        dst.copy_from_slice(&bytes[..len]);
        Ok(out)
    }

    /// Overwrite the start of a buffer argument with `data`.
    pub fn write<T: Pod>(&self, index: usize, data: &[T]) -> Result<(), String> {
        let id = self.mem_id(index)?;
        let src: &[u8] = bytemuck::cast_slice(data);
        let mut memory = self.memory.borrow_mut();
        let dst = memory
            .get_mut(&id)
            .ok_or_else(|| format!("buffer argument {index} was released"))?;
        if src.len() > dst.len() {
            return Err(format!(
                "write of {} bytes overflows buffer argument {index} of {} bytes",
                src.len(),
                dst.len()
            ));
        }
        dst[..src.len()].copy_from_slice(src);
        Ok(())
    }
}
