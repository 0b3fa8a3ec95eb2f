use canary_controller_apis::Canary;
use kube::CustomResourceExt;
use serde_yaml;

pub fn main() {
    println!("{}", serde_yaml::to_string(&Canary::crd()).unwrap());
}
