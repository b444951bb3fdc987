use std::collections::HashMap;
use crate::tensor::{DType, Shape, Tensor, TensorData};
use crate::onnx::{attribute_proto::AttributeType, AttributeProto, NodeProto, TensorProto};
use crate::Error;

pub trait Node {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor>;

    fn get_name(&self) -> Option<&str> {
        None
    }

    fn get_onnx_type(&self) -> &str;

    fn get_onnx_domain(&self) -> &str {
        ""
    }

    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![])
    }

    fn to_node_proto(&self, name: String, output_name: String, tensor_names: &HashMap<&dyn Tensor, String>) -> Result<NodeProto, Error> {
        let mut input = vec![];
        for tensor in self.get_input_tensors() {
            let tensor_name = tensor_names.get(&tensor).ok_or_else(|| Error::NoSuchTensorError(format!("input of {name}")))?;
            input.push(tensor_name.clone());
        }
        Ok(NodeProto {
            name,
            input,
            output: vec![output_name],
            op_type: self.get_onnx_type().to_string(),
            domain: self.get_onnx_domain().to_string(),
            attribute: self.get_onnx_attributes()?,
            .. Default::default()
        })
    }
}

pub trait SingleOutputNode: Node {
    fn get_output_shape(&self) -> &Shape;

    fn get_output_dtype(&self) -> DType;

    fn resolve_output_data(&self) -> Option<TensorData> {
        None
    }
}

pub(crate) fn attr_int(name: &str, value: i64) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Int as i32,
        i: value,
        .. Default::default()
    }
}

pub(crate) fn attr_ints(name: &str, values: &[i64]) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Ints as i32,
        ints: values.to_vec(),
        .. Default::default()
    }
}

pub(crate) fn attr_float(name: &str, value: f32) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Float as i32,
        f: value,
        .. Default::default()
    }
}

pub(crate) fn attr_tensor(name: &str, value: TensorProto) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Tensor as i32,
        t: Some(value),
        .. Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::Constant;

    struct Unencodable;

    impl Node for Unencodable {
        fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
            vec![]
        }
        fn get_onnx_type(&self) -> &str {
            "Identity"
        }
        fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
            Err(Error::UnresolvedDimensionError("n".to_string()))
        }
    }

    #[test]
    fn constant_carries_its_value() {
        let constant = Constant::new(None, TensorData::vector(vec![3i64, 4]));
        let proto = constant.to_node_proto("c".to_string(), "c_output".to_string(), &HashMap::new()).unwrap();
        let value = proto.attribute.iter().find(|x| x.name == "value").unwrap();
        assert_eq!(value.t.as_ref().unwrap().dims, vec![2]);
    }

    #[test]
    fn attribute_errors_fail_the_node() {
        let result = Unencodable.to_node_proto("n".to_string(), "n_output".to_string(), &HashMap::new());
        assert!(matches!(result, Err(Error::UnresolvedDimensionError(_))));
    }
}
