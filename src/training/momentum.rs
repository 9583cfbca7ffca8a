//! Momentum (exponential moving average) parameter updates between a
//! student and a teacher variable map.

use candle_nn::VarMap;

use crate::{FbError, Result};

/// Copy every student variable into the teacher by name.
///
/// Used at construction time so both encoders start from identical weights.
pub fn copy_params(student: &VarMap, teacher: &VarMap) -> Result<()> {
    let student_data = student.data().lock().unwrap();
    let teacher_data = teacher.data().lock().unwrap();
    for (name, teacher_var) in teacher_data.iter() {
        let student_var = student_data.get(name).ok_or_else(|| {
            FbError::Data(format!("teacher variable '{name}' has no student counterpart"))
        })?;
        teacher_var.set(student_var.as_tensor())?;
    }
    Ok(())
}

/// In-place momentum update of the teacher parameters:
/// `teacher = momentum * teacher + (1 - momentum) * student`.
///
/// Variables are matched by name; both maps must have been built by the
/// same construction path.
pub fn momentum_update(student: &VarMap, teacher: &VarMap, momentum: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&momentum) {
        return Err(FbError::Config(format!(
            "momentum must lie in [0, 1], got {momentum}"
        )));
    }
    let student_data = student.data().lock().unwrap();
    let teacher_data = teacher.data().lock().unwrap();
    for (name, teacher_var) in teacher_data.iter() {
        let student_var = student_data.get(name).ok_or_else(|| {
            FbError::Data(format!("teacher variable '{name}' has no student counterpart"))
        })?;
        let updated = ((teacher_var.as_tensor() * momentum)?
            + (student_var.as_tensor() * (1.0 - momentum))?)?;
        teacher_var.set(&updated)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::VarBuilder;

    fn varmap_with(name: &str, value: f32, device: &Device) -> Result<VarMap> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        // materialize one named variable
        let init = candle_nn::Init::Const(value as f64);
        let _ = vb.get_with_hints((2, 2), name, init)?;
        Ok(varmap)
    }

    fn value_of(varmap: &VarMap, name: &str) -> Result<f32> {
        let data = varmap.data().lock().unwrap();
        let var = data.get(name).expect("missing var");
        Ok(var.as_tensor().mean_all()?.to_scalar::<f32>()?)
    }

    #[test]
    fn test_copy_params() -> Result<()> {
        let device = Device::Cpu;
        let student = varmap_with("w", 3.0, &device)?;
        let teacher = varmap_with("w", 0.0, &device)?;
        copy_params(&student, &teacher)?;
        assert_eq!(value_of(&teacher, "w")?, 3.0);
        Ok(())
    }

    #[test]
    fn test_momentum_update_interpolates() -> Result<()> {
        let device = Device::Cpu;
        let student = varmap_with("w", 0.0, &device)?;
        let teacher = varmap_with("w", 1.0, &device)?;
        momentum_update(&student, &teacher, 0.9)?;
        assert!((value_of(&teacher, "w")? - 0.9).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_name_mismatch_is_an_error() -> Result<()> {
        let device = Device::Cpu;
        let student = varmap_with("a", 0.0, &device)?;
        let teacher = varmap_with("b", 1.0, &device)?;
        assert!(momentum_update(&student, &teacher, 0.9).is_err());
        Ok(())
    }

    #[test]
    fn test_momentum_out_of_range_rejected() -> Result<()> {
        let device = Device::Cpu;
        let student = varmap_with("w", 0.0, &device)?;
        let teacher = varmap_with("w", 1.0, &device)?;
        assert!(momentum_update(&student, &teacher, 1.5).is_err());
        Ok(())
    }

    #[test]
    fn test_tensor_content_interpolated_elementwise() -> Result<()> {
        let device = Device::Cpu;
        let student = varmap_with("w", 2.0, &device)?;
        let teacher = varmap_with("w", 4.0, &device)?;
        momentum_update(&student, &teacher, 0.5)?;
        let data = teacher.data().lock().unwrap();
        let t: Tensor = data.get("w").unwrap().as_tensor().clone();
        for row in t.to_vec2::<f32>()? {
            for v in row {
                assert!((v - 3.0).abs() < 1e-6);
            }
        }
        Ok(())
    }
}
