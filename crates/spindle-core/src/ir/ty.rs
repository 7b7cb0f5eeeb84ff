#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Ty {
    I1,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Ptr(Box<Ty>),
    Array(Box<Ty>, u64),
    Struct {
        fields: Vec<Ty>,
        packed: bool,
        name: Option<String>,
    },
    Function {
        return_type: Box<Ty>,
        param_types: Vec<Ty>,
        is_variadic: bool,
    },
    Void,
    Token,
}

impl Ty {
    /// The untyped byte pointer used as the raw frame handle.
    pub fn byte_ptr() -> Ty {
        Ty::Ptr(Box::new(Ty::I8))
    }

    pub fn ptr_to(ty: Ty) -> Ty {
        Ty::Ptr(Box::new(ty))
    }

    pub fn function(return_type: Ty, param_types: Vec<Ty>) -> Ty {
        Ty::Function {
            return_type: Box::new(return_type),
            param_types,
            is_variadic: false,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Ty::Void)
    }

    pub fn struct_fields(&self) -> Option<&[Ty]> {
        match self {
            Ty::Struct { fields, .. } => Some(fields),
            _ => None,
        }
    }
}
