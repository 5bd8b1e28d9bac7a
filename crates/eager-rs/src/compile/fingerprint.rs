//! Cache keys for single operator invocations.

use std::fmt::{self, Write as _};

use crate::backend::hashing::fnv1a_hash;
use crate::ops::{AttrValue, InputRole, OpInvocation};
use crate::tensor::{Tensor, Value};

/// Attributes that describe graph plumbing rather than kernel behaviour.
pub const EXCLUDED_ATTRS: [&str; 5] = [
    "input_names",
    "output_names",
    "IsFeatureMapOutput",
    "IsFeatureMapInputList",
    "pri_format",
];

/// Deterministic key of an invocation. Equal keys select the same kernel and I/O layout.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short digest for log lines.
    pub fn digest(&self) -> u64 {
        fnv1a_hash(self.0.as_bytes())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        CacheKey(value.to_string())
    }
}

/// Builds the cache key of `invocation`.
///
/// Layout: `<target>_<1|0>_<op>_` then `"name"=value;` per kept attribute in name order, with
/// string values quoted too, then one `_`-terminated segment per input, then the stream id, then `r_<instance>_` for operators with
/// hidden side effects. Tensor segments hold the rank (dynamic path) or the shape (static path),
/// `:` and the dtype id, the device layout when present, and `=value` for constants or `~value`
/// for value-dependent positions.
pub fn fingerprint(invocation: &OpInvocation) -> CacheKey {
    let primitive = invocation.primitive();
    let hidden_side_effect = primitive.has_hidden_side_effect();
    let mut key = String::with_capacity(64);

    key.push_str(invocation.target().as_str());
    key.push_str(if invocation.use_dynamic_shape() {
        "_1_"
    } else {
        "_0_"
    });
    key.push_str(primitive.name());
    key.push('_');

    for (name, value) in primitive.attrs() {
        if EXCLUDED_ATTRS.contains(&name) {
            continue;
        }
        // Quoted so separators inside a name or string cannot spell another attribute.
        let _ = match value {
            AttrValue::Str(text) => write!(key, "{name:?}={text:?};"),
            other => write!(key, "{name:?}={other};"),
        };
    }

    let depend = invocation.value_depend_positions();
    for (index, value) in invocation.inputs().iter().enumerate() {
        let role = invocation.roles().get(index).copied();
        match value {
            Value::Tensor(tensor) => {
                push_tensor(&mut key, tensor, invocation.use_dynamic_shape(), hidden_side_effect);
                if role == Some(InputRole::Constant) {
                    key.push('=');
                    key.push_str(&tensor.value_string());
                } else if depend.contains(&index) {
                    key.push('~');
                    key.push_str(&tensor.value_string());
                }
            }
            other => {
                let _ = write!(key, "{other}");
            }
        }
        key.push('_');
    }

    let _ = write!(key, "{}", invocation.stream_id());
    if hidden_side_effect {
        let _ = write!(key, "r_{}_", primitive.instance_id());
    }
    CacheKey(key)
}

fn push_tensor(key: &mut String, tensor: &Tensor, dynamic: bool, hidden_side_effect: bool) {
    if dynamic {
        let _ = write!(key, "{}", tensor.spec().shape.rank());
    } else {
        let shape = tensor.base_shape().unwrap_or(&tensor.spec().shape);
        let _ = write!(key, "{shape}");
    }
    let _ = write!(key, ":{}", tensor.spec().dtype.type_id());
    if hidden_side_effect {
        return;
    }
    if let Some(layout) = tensor.layout() {
        let _ = write!(key, "@{}", layout.format);
        if !layout.padding.is_empty() {
            let _ = write!(key, "/{}", layout.padding);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{DType, DeviceLayout, DeviceTarget, Dimension, Shape, TensorSpec};
    use crate::ops::{AbstractValue, Primitive};
    use crate::tensor::Scalar;

    fn out(dims: &[usize]) -> AbstractValue {
        AbstractValue::Tensor(TensorSpec::new(DType::F32, Shape::from_static(dims)))
    }

    fn zeros(dims: &[usize]) -> Tensor {
        let count: usize = dims.iter().product();
        Tensor::from_f32(dims, &vec![0.0; count])
    }

    fn add(x: &[usize], y: &[usize]) -> OpInvocation {
        OpInvocation::new(Primitive::new("Add"), out(x), DeviceTarget::Gpu)
            .with_input(zeros(x), InputRole::OpOutput)
            .with_input(zeros(y), InputRole::OpOutput)
    }

    #[test]
    fn static_key_layout() {
        let key = fingerprint(&add(&[2, 3], &[2, 3]));
        assert_eq!(key.as_str(), "GPU_0_Add_[2,3]:43_[2,3]:43_0");
    }

    #[test]
    fn structurally_identical_invocations_share_a_key() {
        assert_eq!(
            fingerprint(&add(&[2, 3], &[2, 3])),
            fingerprint(&add(&[2, 3], &[2, 3]))
        );
        assert_ne!(
            fingerprint(&add(&[2, 3], &[2, 3])),
            fingerprint(&add(&[2, 3], &[4, 3]))
        );
    }

    #[test]
    fn dynamic_path_keys_by_rank_with_a_distinct_prefix() {
        let static_key = fingerprint(&add(&[2, 3], &[2, 3]));
        let dynamic = fingerprint(&add(&[2, 3], &[2, 3]).with_dynamic_shape(true));
        let other_dims = fingerprint(&add(&[5, 7], &[5, 7]).with_dynamic_shape(true));
        assert!(dynamic.as_str().starts_with("GPU_1_"));
        assert_ne!(static_key, dynamic);
        assert_eq!(dynamic, other_dims);
    }

    #[test]
    fn excluded_attributes_do_not_split_entries() {
        let plain = OpInvocation::new(
            Primitive::new("ReduceSum").with_attr("keep_dims", false),
            out(&[2]),
            DeviceTarget::Gpu,
        );
        let named = OpInvocation::new(
            Primitive::new("ReduceSum")
                .with_attr("keep_dims", false)
                .with_attr("input_names", "x"),
            out(&[2]),
            DeviceTarget::Gpu,
        );
        let kept = OpInvocation::new(
            Primitive::new("ReduceSum").with_attr("keep_dims", true),
            out(&[2]),
            DeviceTarget::Gpu,
        );
        assert_eq!(fingerprint(&plain), fingerprint(&named));
        assert_ne!(fingerprint(&plain), fingerprint(&kept));
    }

    #[test]
    fn string_attributes_cannot_spell_other_attributes() {
        let cast = |primitive: Primitive| {
            fingerprint(&OpInvocation::new(primitive, out(&[2]), DeviceTarget::Gpu))
        };
        let packed = cast(Primitive::new("Cast").with_attr("a", "1;b=2"));
        let split = cast(Primitive::new("Cast").with_attr("a", "1").with_attr("b", "2"));
        assert_ne!(packed, split);
        assert_eq!(split.as_str(), "GPU_0_Cast_\"a\"=\"1\";\"b\"=\"2\";0");

        let named = cast(Primitive::new("Cast").with_attr("a=1;b", 2i64));
        let plain = cast(Primitive::new("Cast").with_attr("a", 1i64).with_attr("b", 2i64));
        assert_ne!(named, plain);
    }

    #[test]
    fn constant_and_value_depend_inputs_contribute_values() {
        let axis = |value: f32| Tensor::from_f32(&[1], &[value]);
        let with_axis = |value: f32, role: InputRole| {
            OpInvocation::new(
                Primitive::new("Gather").with_value_depend(1),
                out(&[2]),
                DeviceTarget::Gpu,
            )
            .with_input(zeros(&[4]), InputRole::OpOutput)
            .with_input(axis(value), role)
        };
        assert_ne!(
            fingerprint(&with_axis(0.0, InputRole::OpOutput)),
            fingerprint(&with_axis(1.0, InputRole::OpOutput))
        );
        assert_ne!(
            fingerprint(&with_axis(0.0, InputRole::Constant)),
            fingerprint(&with_axis(0.0, InputRole::OpOutput))
        );
        let dynamic_a = fingerprint(&with_axis(0.0, InputRole::OpOutput).with_dynamic_shape(true));
        let dynamic_b = fingerprint(&with_axis(1.0, InputRole::OpOutput).with_dynamic_shape(true));
        assert_ne!(dynamic_a, dynamic_b);
    }

    #[test]
    fn layout_and_base_shape_are_encoded() {
        let nz = zeros(&[2, 3]).with_layout(DeviceLayout::new("FRACTAL_NZ").with_padding("NC"));
        let invocation = OpInvocation::new(Primitive::new("Relu"), out(&[2, 3]), DeviceTarget::Ascend)
            .with_input(nz, InputRole::OpOutput);
        assert_eq!(
            fingerprint(&invocation).as_str(),
            "Ascend_0_Relu_[2,3]:43@FRACTAL_NZ/NC_0"
        );

        let partial = zeros(&[2, 3]).with_base_shape(Shape::new(vec![
            Dimension::Static(2),
            Dimension::Dynamic,
        ]));
        let invocation = OpInvocation::new(Primitive::new("Relu"), out(&[2, 3]), DeviceTarget::Gpu)
            .with_input(partial, InputRole::OpOutput);
        assert_eq!(fingerprint(&invocation).as_str(), "GPU_0_Relu_[2,-1]:43_0");
    }

    #[test]
    fn hidden_side_effects_are_disambiguated_per_instance() {
        let dropout = |primitive: Primitive| {
            OpInvocation::new(primitive, out(&[4]), DeviceTarget::Gpu)
                .with_input(zeros(&[4]), InputRole::OpOutput)
        };
        let first = Primitive::new("Dropout").with_hidden_side_effect();
        let second = Primitive::new("Dropout").with_hidden_side_effect();
        assert_eq!(
            fingerprint(&dropout(first.clone())),
            fingerprint(&dropout(first.clone()))
        );
        assert_ne!(fingerprint(&dropout(first)), fingerprint(&dropout(second)));
    }

    #[test]
    fn non_tensor_inputs_use_their_display_form() {
        let invocation = OpInvocation::new(Primitive::new("Pow"), out(&[2]), DeviceTarget::Cpu)
            .with_input(zeros(&[2]), InputRole::OpOutput)
            .with_input(Value::Scalar(Scalar::Float(2.0)), InputRole::Constant)
            .with_stream(3);
        assert_eq!(fingerprint(&invocation).as_str(), "CPU_0_Pow_[2]:43_2.0_3");
    }
}
