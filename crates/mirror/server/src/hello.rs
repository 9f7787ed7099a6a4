//! The built-in root the hosting binary serves. Doubles as the reference for
//! wiring an application type into the fabric.

use std::sync::{Arc, Mutex, OnceLock};

use crate::descriptor::{Descriptor, ParamKind};
use crate::object::{DtoCore, ServerData, ServerDto};

pub(crate) fn root() -> Arc<dyn ServerDto> {
	Arc::new(Hello {
		core: DtoCore::new(),
		greeting: Mutex::new("hello".to_owned()),
	})
}

struct Hello {
	core: DtoCore,
	greeting: Mutex<String>,
}

fn descriptor() -> &'static Descriptor {
	static DESCRIPTOR: OnceLock<Descriptor> = OnceLock::new();
	DESCRIPTOR.get_or_init(|| {
		Descriptor::builder::<Hello>("Hello")
			.method("Echo", &[ParamKind::Text], |_, mut args| Ok(args.remove(0)))
			.property_rw(
				"Greeting",
				ParamKind::Text,
				|hello: &Hello| {
					ServerData::from(hello.greeting.lock().expect("poisoned").clone())
				},
				|hello: &Hello, value| {
					let greeting = value.as_str().expect("aligned").to_owned();
					*hello.greeting.lock().expect("poisoned") = greeting;
					hello.core.property_changed("Greeting");
					Ok(())
				},
			)
			.build()
	})
}

impl ServerDto for Hello {
	fn core(&self) -> &DtoCore {
		&self.core
	}

	fn descriptor(&self) -> &Descriptor {
		descriptor()
	}

	fn as_any(&self) -> &(dyn std::any::Any + Send + Sync) {
		self
	}
}
