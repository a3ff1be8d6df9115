// Copyright 2018 Loom project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]

use std::fmt;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use serde_derive::{Deserialize, Serialize};
use status::{Result, Status};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int32,
    Int64,
    Float,
    Double,
}

impl DataType {
    pub fn element_size(&self) -> usize {
        match self {
            DataType::Bool => 1,
            DataType::Int32 => 4,
            DataType::Int64 => 8,
            DataType::Float => 4,
            DataType::Double => 8,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            DataType::Bool => "bool",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Float => "float",
            DataType::Double => "double",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TensorShape(pub Vec<usize>);

impl TensorShape {
    pub fn scalar() -> TensorShape {
        TensorShape(Vec::new())
    }

    pub fn vector(len: usize) -> TensorShape {
        TensorShape(vec![len])
    }

    pub fn num_elements(&self) -> usize {
        self.0.iter().product()
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

///
/// An opaque identifier for one raw allocation, standing in for the raw
/// pointer a C allocator would hand out. Allocators key their bookkeeping on
/// it; buffers return it on drop.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BufferHandle(pub u64);

///
/// Attributes a producer requests of the allocator backing an output, and
/// that travel with the value so consumers know where it lives.
///
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AllocatorAttributes {
    pub on_host: bool,
}

/// Storage as handed out by an `Allocator`, before it is bound to the
/// allocator that must be notified of its death.
pub struct RawBuffer {
    pub handle: BufferHandle,
    pub data: Box<[u8]>,
}

///
/// Raw memory provider. Implementations live in the device layer; the trait
/// lives here because a `TensorBuffer` must be able to notify its allocator
/// when it is dropped, however long it outlives the op that produced it.
///
pub trait Allocator: Send + Sync {
    fn name(&self) -> String;

    /// Returns None if the allocation is not admitted. The caller decides
    /// whether that is fatal.
    fn allocate_raw(&self, alignment: usize, num_bytes: usize) -> Option<RawBuffer>;

    fn deallocate_raw(&self, handle: BufferHandle);

    fn tracks_allocation_sizes(&self) -> bool {
        false
    }

    fn requested_size(&self, _handle: BufferHandle) -> Option<usize> {
        None
    }

    fn allocation_id(&self, _handle: BufferHandle) -> i64 {
        0
    }

    fn should_allocate_empty_tensors(&self) -> bool {
        false
    }
}

///
/// Allocates `num_bytes` through `allocator` and binds the resulting buffer
/// to it for deallocation on drop.
///
pub fn allocate_buffer(
    allocator: &Arc<dyn Allocator>,
    alignment: usize,
    num_bytes: usize,
) -> Option<TensorBuffer> {
    let raw = allocator.allocate_raw(alignment, num_bytes)?;
    Some(TensorBuffer {
        handle: raw.handle,
        data: raw.data,
        allocator: Some(allocator.clone()),
    })
}

pub struct TensorBuffer {
    handle: BufferHandle,
    data: Box<[u8]>,
    // None for buffers on the untracked heap (constants, feeds).
    allocator: Option<Arc<dyn Allocator>>,
}

impl TensorBuffer {
    fn untracked(data: Box<[u8]>) -> TensorBuffer {
        TensorBuffer {
            handle: BufferHandle(0),
            data,
            allocator: None,
        }
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}

impl Drop for TensorBuffer {
    fn drop(&mut self) {
        if let Some(allocator) = &self.allocator {
            allocator.deallocate_raw(self.handle);
        }
    }
}

impl fmt::Debug for TensorBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TensorBuffer({:?}, {} bytes)", self.handle, self.data.len())
    }
}

///
/// A dense typed value. The buffer is shared: clones are cheap and alias the
/// same storage. Mutation is only possible while the buffer is unshared,
/// which is the window between allocation and publication as an output.
///
#[derive(Clone, Debug)]
pub struct Tensor {
    dtype: DataType,
    shape: TensorShape,
    buf: Option<Arc<TensorBuffer>>,
}

macro_rules! typed_access {
    ($dtype:ident, $ty:ty, $at:ident, $set:ident, $scalar_new:ident, $scalar_get:ident, $read:expr, $write:expr) => {
        pub fn $scalar_new(v: $ty) -> Tensor {
            let mut t = Tensor::untracked(DataType::$dtype, TensorShape::scalar());
            t.$set(0, v).expect("freshly allocated scalar is writable");
            t
        }

        pub fn $scalar_get(&self) -> Result<$ty> {
            if self.shape.num_elements() != 1 {
                return Err(Status::invalid_argument(format!(
                    "expected a scalar, got shape {}",
                    self.shape
                )));
            }
            self.$at(0)
        }

        pub fn $at(&self, index: usize) -> Result<$ty> {
            let data = self.element_bytes(DataType::$dtype, index)?;
            let read = $read;
            Ok(read(data))
        }

        pub fn $set(&mut self, index: usize, v: $ty) -> Result<()> {
            let data = self.element_bytes_mut(DataType::$dtype, index)?;
            let write = $write;
            write(data, v);
            Ok(())
        }
    };
}

impl Tensor {
    ///
    /// A tensor on the untracked heap, zero-initialized. Used for constants,
    /// feeds and test fixtures; op outputs go through `Tensor::allocate`.
    ///
    pub fn untracked(dtype: DataType, shape: TensorShape) -> Tensor {
        let num_bytes = shape.num_elements() * dtype.element_size();
        let buf = if num_bytes == 0 {
            None
        } else {
            Some(Arc::new(TensorBuffer::untracked(
                vec![0_u8; num_bytes].into_boxed_slice(),
            )))
        };
        Tensor { dtype, shape, buf }
    }

    ///
    /// A tensor backed by `allocator`. Returns None when the allocator does
    /// not admit the request.
    ///
    pub fn allocate(
        dtype: DataType,
        shape: TensorShape,
        allocator: &Arc<dyn Allocator>,
    ) -> Option<Tensor> {
        let num_bytes = shape.num_elements() * dtype.element_size();
        if num_bytes == 0 && !allocator.should_allocate_empty_tensors() {
            return Some(Tensor {
                dtype,
                shape,
                buf: None,
            });
        }
        let buf = allocate_buffer(allocator, dtype.element_size(), num_bytes)?;
        Some(Tensor {
            dtype,
            shape,
            buf: Some(Arc::new(buf)),
        })
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn num_elements(&self) -> usize {
        self.shape.num_elements()
    }

    pub fn total_bytes(&self) -> usize {
        self.buf.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    pub fn buffer(&self) -> Option<&Arc<TensorBuffer>> {
        self.buf.as_ref()
    }

    fn element_bytes(&self, dtype: DataType, index: usize) -> Result<&[u8]> {
        if self.dtype != dtype {
            return Err(Status::invalid_argument(format!(
                "expected {} but tensor is {}",
                dtype, self.dtype
            )));
        }
        if index >= self.shape.num_elements() {
            return Err(Status::invalid_argument(format!(
                "index {index} out of range for shape {}",
                self.shape
            )));
        }
        let size = dtype.element_size();
        let buf = self
            .buf
            .as_ref()
            .ok_or_else(|| Status::internal("tensor has no backing buffer"))?;
        Ok(&buf.data[index * size..(index + 1) * size])
    }

    fn element_bytes_mut(&mut self, dtype: DataType, index: usize) -> Result<&mut [u8]> {
        self.element_bytes(dtype, index)?;
        let size = dtype.element_size();
        let buf = self.buf.as_mut().expect("checked by element_bytes");
        let buf = Arc::get_mut(buf).ok_or_else(|| {
            Status::internal("cannot mutate a tensor whose buffer is shared")
        })?;
        Ok(&mut buf.data[index * size..(index + 1) * size])
    }

    typed_access!(
        Bool,
        bool,
        bool_at,
        set_bool,
        scalar_bool,
        as_scalar_bool,
        |d: &[u8]| d[0] != 0,
        |d: &mut [u8], v: bool| d[0] = v as u8
    );
    typed_access!(
        Int32,
        i32,
        i32_at,
        set_i32,
        scalar_i32,
        as_scalar_i32,
        |d: &[u8]| LittleEndian::read_i32(d),
        |d: &mut [u8], v: i32| LittleEndian::write_i32(d, v)
    );
    typed_access!(
        Int64,
        i64,
        i64_at,
        set_i64,
        scalar_i64,
        as_scalar_i64,
        |d: &[u8]| LittleEndian::read_i64(d),
        |d: &mut [u8], v: i64| LittleEndian::write_i64(d, v)
    );
    typed_access!(
        Float,
        f32,
        f32_at,
        set_f32,
        scalar_f32,
        as_scalar_f32,
        |d: &[u8]| LittleEndian::read_f32(d),
        |d: &mut [u8], v: f32| LittleEndian::write_f32(d, v)
    );
    typed_access!(
        Double,
        f64,
        f64_at,
        set_f64,
        scalar_f64,
        as_scalar_f64,
        |d: &[u8]| LittleEndian::read_f64(d),
        |d: &mut [u8], v: f64| LittleEndian::write_f64(d, v)
    );

    pub fn from_i64s(values: &[i64]) -> Tensor {
        let mut t = Tensor::untracked(DataType::Int64, TensorShape::vector(values.len()));
        for (i, v) in values.iter().enumerate() {
            t.set_i64(i, *v).expect("freshly allocated vector is writable");
        }
        t
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Tensor) -> bool {
        self.dtype == other.dtype
            && self.shape == other.shape
            && match (&self.buf, &other.buf) {
                (Some(a), Some(b)) => a.data == b.data,
                (None, None) => true,
                _ => false,
            }
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Tensor<{} {}>", self.dtype, self.shape)
    }
}

///
/// The wire form of a tensor, used in request payloads.
///
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TensorDef {
    pub dtype: Option<DataType>,
    pub shape: Vec<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bool_vals: Vec<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub int_vals: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub float_vals: Vec<f64>,
}

impl TensorDef {
    pub fn from_tensor(t: &Tensor) -> Result<TensorDef> {
        let mut def = TensorDef {
            dtype: Some(t.dtype()),
            shape: t.shape().dims().to_vec(),
            ..TensorDef::default()
        };
        for i in 0..t.num_elements() {
            match t.dtype() {
                DataType::Bool => def.bool_vals.push(t.bool_at(i)?),
                DataType::Int32 => def.int_vals.push(i64::from(t.i32_at(i)?)),
                DataType::Int64 => def.int_vals.push(t.i64_at(i)?),
                DataType::Float => def.float_vals.push(f64::from(t.f32_at(i)?)),
                DataType::Double => def.float_vals.push(t.f64_at(i)?),
            }
        }
        Ok(def)
    }

    pub fn to_tensor(&self) -> Result<Tensor> {
        let dtype = self
            .dtype
            .ok_or_else(|| Status::invalid_argument("tensor def has no dtype"))?;
        let shape = TensorShape(self.shape.clone());
        let n = shape.num_elements();
        let mut t = Tensor::untracked(dtype, shape);
        let check = |len: usize| {
            if len == n {
                Ok(())
            } else {
                Err(Status::invalid_argument(format!(
                    "tensor def carries {len} values for {n} elements"
                )))
            }
        };
        match dtype {
            DataType::Bool => {
                check(self.bool_vals.len())?;
                for (i, v) in self.bool_vals.iter().enumerate() {
                    t.set_bool(i, *v)?;
                }
            }
            DataType::Int32 => {
                check(self.int_vals.len())?;
                for (i, v) in self.int_vals.iter().enumerate() {
                    t.set_i32(i, *v as i32)?;
                }
            }
            DataType::Int64 => {
                check(self.int_vals.len())?;
                for (i, v) in self.int_vals.iter().enumerate() {
                    t.set_i64(i, *v)?;
                }
            }
            DataType::Float => {
                check(self.float_vals.len())?;
                for (i, v) in self.float_vals.iter().enumerate() {
                    t.set_f32(i, *v as f32)?;
                }
            }
            DataType::Double => {
                check(self.float_vals.len())?;
                for (i, v) in self.float_vals.iter().enumerate() {
                    t.set_f64(i, *v)?;
                }
            }
        }
        Ok(t)
    }
}

#[cfg(test)]
mod tests {
    use super::{DataType, Tensor, TensorDef, TensorShape};

    #[test]
    fn scalar_roundtrip() {
        let t = Tensor::scalar_i64(7);
        assert_eq!(t.as_scalar_i64().unwrap(), 7);
        assert_eq!(t.dtype(), DataType::Int64);
        assert_eq!(t.num_elements(), 1);
    }

    #[test]
    fn dtype_mismatch_is_invalid_argument() {
        let t = Tensor::scalar_i64(7);
        let err = t.as_scalar_i32().unwrap_err();
        assert_eq!(err.code(), status::Code::InvalidArgument);
    }

    #[test]
    fn shared_buffers_are_immutable() {
        let mut t = Tensor::scalar_i64(7);
        let _alias = t.clone();
        assert!(t.set_i64(0, 8).is_err());
    }

    #[test]
    fn def_roundtrip() {
        let t = Tensor::from_i64s(&[1, 2, 3]);
        let def = TensorDef::from_tensor(&t).unwrap();
        assert_eq!(def.to_tensor().unwrap(), t);
        assert_eq!(def.shape, vec![3]);
    }

    #[test]
    fn empty_tensor_has_no_buffer() {
        let t = Tensor::untracked(DataType::Float, TensorShape::vector(0));
        assert_eq!(t.total_bytes(), 0);
        assert!(t.buffer().is_none());
    }
}
