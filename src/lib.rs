pub mod config;
pub mod error;
pub mod event;
pub mod neighbor;
pub mod node;
pub mod objective;
pub mod option;
pub mod packet;
pub mod routing;
pub mod scheduler;
pub mod sim;
pub mod transport;
pub mod trickle;

pub use config::{InterfaceAddress, RootConfig, RplConfig};
pub use error::{Result, RplError};
pub use event::Event;
pub use neighbor::{Neighbor, NeighborSet};
pub use node::{Context, NodeState, RplNode};
pub use objective::ObjectiveFunction;
pub use packet::{Message, ModeOfOperation, Packet};
pub use routing::{Route, RoutingEntry, RoutingTable};
pub use scheduler::{Scheduler, Timer, TimerHandle};
pub use transport::{Datagram, SocketBinding, SocketId, Transport};
